// kiln/src/cli/info.rs
//! Contains the logic for the `info` command.
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::dependency::DependencyPhase;
use kiln_common::error::Result;
use kiln_common::formulary::Formulary;
use kiln_common::keg::{InstalledIndex, InstalledKeg};
use kiln_common::model::{Formula, SourceSpec};

#[derive(Args, Debug)]
pub struct Info {
    /// Name of the formula, or a path to a formula file
    pub name: String,
}

impl Info {
    pub fn run(&self, config: &Config) -> Result<()> {
        tracing::debug!("Getting info for formula: {}", self.name);
        let formulary = Formulary::new(config);
        let formula = formulary.load_target(&self.name)?;
        let index = InstalledIndex::load(config.installed_index_path())?;
        print_formula_info(&formula, index.get(&formula.name).as_ref());
        Ok(())
    }
}

fn print_formula_info(formula: &Formula, installed: Option<&InstalledKeg>) {
    println!("{}", format!("Formula: {}", formula.name).green().bold());
    if let Some(desc) = formula.desc.as_deref().filter(|d| !d.is_empty()) {
        println!("  {desc}");
    }

    let (kind, detail) = match &formula.source {
        SourceSpec::Archive { sha256, .. } => ("archive", format!("sha256 {sha256}")),
        SourceSpec::Head { branch, .. } => ("head", format!("branch {branch}")),
        SourceSpec::Revision { revision, .. } => ("revision", format!("commit {revision}")),
    };
    println!();
    println!("{:<10} {}", "Version".bold(), formula.version.as_deref().unwrap_or("HEAD"));
    println!("{:<10} {}", "License".bold(), formula.license.as_deref().unwrap_or("N/A"));
    println!("{:<10} {}", "Homepage".bold(), formula.homepage.as_deref().unwrap_or("N/A"));
    println!("{:<10} {} ({})", "Source".bold(), formula.source.url(), kind);
    println!("{:<10} {}", "", detail.dimmed());

    if !formula.dependencies().is_empty() {
        println!("\n{}", "Dependencies".blue().bold());
        for dep in formula.dependencies() {
            let tag = match dep.phase {
                DependencyPhase::Build => "build",
                DependencyPhase::Run => "run",
            };
            println!("  {:<20} {}", dep.name.cyan(), tag.dimmed());
        }
    }

    if !formula.install.is_empty() {
        println!("\n{}", "Install".blue().bold());
        for (i, step) in formula.install.iter().enumerate() {
            println!("  {i}. {}", step.describe());
        }
    }

    if !formula.test.is_empty() {
        println!("\n{}", "Test".blue().bold());
        for assertion in &formula.test {
            println!("  - {}", assertion.description());
        }
    }

    println!();
    match installed {
        Some(keg) => println!(
            "{} {} at {}",
            "Installed:".green().bold(),
            keg.version,
            keg.prefix.display()
        ),
        None => println!("{}", "Not installed".yellow()),
    }
}
