// kiln/src/cli/list.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::keg::{InstalledIndex, InstalledKeg};

#[derive(Args, Debug)]
pub struct List {
    /// Print the installed index as JSON
    #[arg(long)]
    pub json: bool,
}

impl List {
    pub fn run(&self, config: &Config) -> Result<()> {
        let index = InstalledIndex::load(config.installed_index_path())?;
        let installed = index.snapshot();

        if self.json {
            let kegs: Vec<&InstalledKeg> = installed.values().collect();
            println!("{}", serde_json::to_string_pretty(&kegs)?);
            return Ok(());
        }

        if installed.is_empty() {
            println!("{}", "0 formulae installed".yellow());
            return Ok(());
        }

        println!(
            "{:<20} {:<24} {:<14} {}",
            "Name".bold(),
            "Version".bold(),
            "Source".bold(),
            "Installed".bold()
        );
        for keg in installed.values() {
            println!(
                "{:<20} {:<24} {:<14} {}",
                keg.name.cyan(),
                keg.version,
                keg.source.short().dimmed(),
                keg.installed_at.format("%Y-%m-%d %H:%M")
            );
        }
        println!(
            "\n{}",
            format!("{} formulae installed", installed.len()).bold()
        );
        Ok(())
    }
}
