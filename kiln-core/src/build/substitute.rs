// kiln-core/src/build/substitute.rs
//! Expansion of recipe placeholders for one attempt.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use kiln_common::model::placeholder::{ArgBundle, PathVar, Segment, Template};

/// Values behind every placeholder of one build. Built once per attempt and never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitutions {
    formula: String,
    version: String,
    prefix: PathBuf,
    root: PathBuf,
    opt: PathBuf,
    buildpath: PathBuf,
    dependencies: BTreeMap<String, PathBuf>,
}

impl Substitutions {
    pub fn new(
        formula: impl Into<String>,
        version: impl Into<String>,
        prefix: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        buildpath: impl Into<PathBuf>,
        dependencies: BTreeMap<String, PathBuf>,
    ) -> Self {
        let formula = formula.into();
        let root = root.into();
        Self {
            opt: root.join("opt").join(&formula),
            version: version.into(),
            prefix: prefix.into(),
            buildpath: buildpath.into(),
            dependencies,
            formula,
            root,
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn var(&self, var: PathVar) -> String {
        let path = match var {
            PathVar::Prefix => self.prefix.clone(),
            PathVar::Bin => self.prefix.join("bin"),
            PathVar::Sbin => self.prefix.join("sbin"),
            PathVar::Lib => self.prefix.join("lib"),
            PathVar::Libexec => self.prefix.join("libexec"),
            PathVar::Include => self.prefix.join("include"),
            PathVar::Share => self.prefix.join("share"),
            PathVar::Pkgshare => self.prefix.join("share").join(&self.formula),
            PathVar::Man => self.prefix.join("share").join("man"),
            PathVar::Etc => self.prefix.join("etc"),
            PathVar::Opt => self.opt.clone(),
            PathVar::Buildpath => self.buildpath.clone(),
            PathVar::Root => self.root.clone(),
            PathVar::Name => return self.formula.clone(),
            PathVar::Version => return self.version.clone(),
        };
        path.to_string_lossy().into_owned()
    }

    fn dependency(&self, name: &str, raw: &str) -> Result<String> {
        self.dependencies
            .get(name)
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| KilnError::UnresolvedDependency {
                formula: self.formula.clone(),
                dependency: name.to_string(),
                reason: format!("no resolved path for '{raw}'"),
            })
    }

    /// Expands a template into a single string. Bundles are rejected.
    pub fn expand(&self, template: &Template) -> Result<String> {
        let mut out = String::new();
        for segment in template.segments() {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var(var) => out.push_str(&self.var(*var)),
                Segment::Dep(name) => out.push_str(&self.dependency(name, template.raw())?),
                Segment::Bundle(bundle) => {
                    return Err(KilnError::ValidationError(format!(
                        "'{{{}}}' cannot be expanded inside '{}'",
                        bundle.as_str(),
                        template.raw()
                    )))
                }
            }
        }
        Ok(out)
    }

    pub fn expand_str(&self, raw: &str) -> Result<String> {
        self.expand(&Template::parse_value(raw)?)
    }

    /// Expands one tool argument, which may be a bundle of several.
    pub fn expand_arg(&self, raw: &str, ldflags: Option<&str>) -> Result<Vec<String>> {
        let template = Template::parse_arg(raw)?;
        match template.bundle() {
            Some(bundle) => self.bundle(bundle, ldflags),
            None => Ok(vec![self.expand(&template)?]),
        }
    }

    pub fn bundle(&self, bundle: ArgBundle, ldflags: Option<&str>) -> Result<Vec<String>> {
        let prefix = self.var(PathVar::Prefix);
        let args = match bundle {
            ArgBundle::StdGoArgs => {
                let mut args = vec![
                    "-trimpath".to_string(),
                    format!("-o={}/{}", self.var(PathVar::Bin), self.formula),
                ];
                if let Some(flags) = ldflags {
                    args.push(format!("-ldflags={}", self.expand_str(flags)?));
                }
                args
            }
            ArgBundle::StdCargoArgs => vec![
                "--locked".to_string(),
                format!("--root={prefix}"),
                "--path=.".to_string(),
            ],
            ArgBundle::StdCmakeArgs => vec![
                format!("-DCMAKE_INSTALL_PREFIX={prefix}"),
                "-DCMAKE_INSTALL_LIBDIR=lib".to_string(),
                "-DCMAKE_BUILD_TYPE=Release".to_string(),
                "-DCMAKE_FIND_FRAMEWORK=LAST".to_string(),
                "-DCMAKE_VERBOSE_MAKEFILE=ON".to_string(),
                "-DBUILD_TESTING=OFF".to_string(),
                "-Wno-dev".to_string(),
            ],
            ArgBundle::StdConfigureArgs => vec![
                "--disable-debug".to_string(),
                "--disable-dependency-tracking".to_string(),
                format!("--prefix={prefix}"),
                format!("--libdir={}", self.var(PathVar::Lib)),
            ],
        };
        Ok(args)
    }

    /// Expands a path template; relative results are taken relative to the prefix.
    pub fn resolve_path(&self, raw: &str) -> Result<PathBuf> {
        let expanded = PathBuf::from(self.expand_str(raw)?);
        if expanded.is_absolute() {
            Ok(expanded)
        } else {
            Ok(self.prefix.join(expanded))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn subs() -> Substitutions {
        Substitutions::new(
            "dvd",
            "HEAD-abcdef0",
            "/k/Cellar/dvd/HEAD-abcdef0",
            "/k",
            "/k/tmp/dvd-x/source",
            BTreeMap::from([("go".to_string(), PathBuf::from("/k/Cellar/go/1.22"))]),
        )
    }

    #[test]
    fn std_go_args_include_ldflags_when_set() {
        let s = subs();
        assert_eq!(
            s.expand_arg("{std_go_args}", Some("-s -w")).unwrap(),
            vec![
                "-trimpath",
                "-o=/k/Cellar/dvd/HEAD-abcdef0/bin/dvd",
                "-ldflags=-s -w"
            ]
        );
        assert_eq!(s.expand_arg("{std_go_args}", None).unwrap().len(), 2);
    }

    #[test]
    fn expands_vars_dependencies_and_escapes() {
        let s = subs();
        assert_eq!(
            s.expand_arg("--with-go={dep:go}/bin", None).unwrap(),
            vec!["--with-go=/k/Cellar/go/1.22/bin"]
        );
        assert_eq!(
            s.expand_str("{{{name}}}-{version}").unwrap(),
            "{dvd}-HEAD-abcdef0"
        );
        assert_eq!(s.var(PathVar::Opt), "/k/opt/dvd");
        assert_eq!(s.var(PathVar::Pkgshare), "/k/Cellar/dvd/HEAD-abcdef0/share/dvd");
    }

    #[test]
    fn unknown_dependency_is_unresolved() {
        let err = subs().expand_str("{dep:cmake}").unwrap_err();
        assert!(matches!(
            err,
            KilnError::UnresolvedDependency { ref dependency, .. } if dependency == "cmake"
        ));
    }

    #[test]
    fn relative_paths_are_under_the_prefix() {
        let s = subs();
        assert_eq!(
            s.resolve_path("bin/dvd").unwrap(),
            PathBuf::from("/k/Cellar/dvd/HEAD-abcdef0/bin/dvd")
        );
        assert_eq!(s.resolve_path("{bin}/dvd").unwrap(), s.resolve_path("bin/dvd").unwrap());
        assert_eq!(s.resolve_path("/etc/hosts").unwrap(), PathBuf::from("/etc/hosts"));
    }
}
