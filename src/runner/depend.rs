//! The dependency phase of a test.
//!
//! Runs in the test's directory before the program starts, in this order:
//!
//! 1. `uninstall`: `<python> -m pip uninstall -qq -y -r <tmpfile>`
//! 2. `files`: each `source` URL is downloaded to `file`
//! 3. `requirements`: one `<python> -m pip install <options> <requirement>`
//!    per requirement, with `-qq` when no options are given
//!
//! Every source scheme is checked before any step runs. Any failure is an
//! error for the whole invocation.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::spec::{DependSpec, FileDependency};

use super::process::{self, Invocation};
use super::{RunError, RunResult};

const DEFAULT_INSTALL_OPTIONS: &[&str] = &["-qq"];

/// Returns `true` for sources that can be downloaded.
pub fn is_supported_source(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Fails on the first file dependency with an unsupported scheme.
pub fn check_sources(depend: &DependSpec) -> RunResult<()> {
    match depend.files.iter().find(|f| !is_supported_source(&f.source)) {
        Some(f) => Err(RunError::UnsupportedSource {
            file: f.file.clone(),
            url: f.source.clone(),
        }),
        None => Ok(()),
    }
}

/// `<python> -m pip install ...` command lines, one per requirement.
pub fn install_commands(depend: &DependSpec, python: &str) -> RunResult<Vec<Vec<String>>> {
    let options: Vec<String> = if depend.pip_install_options.is_empty() {
        DEFAULT_INSTALL_OPTIONS.iter().map(|s| s.to_string()).collect()
    } else {
        depend.pip_install_options.clone()
    };

    depend
        .requirements
        .iter()
        .map(|req| {
            let words = shell_words::split(req).map_err(|e| RunError::Dependency {
                command: format!("pip install {req}"),
                reason: format!("cannot split requirement: {e}"),
            })?;
            let mut argv = pip_argv(python, "install");
            argv.extend(options.iter().cloned());
            argv.extend(words);
            Ok(argv)
        })
        .collect()
}

fn pip_argv(python: &str, verb: &str) -> Vec<String> {
    vec![
        python.to_string(),
        "-m".to_string(),
        "pip".to_string(),
        verb.to_string(),
    ]
}

fn secs(timeout: Option<u64>) -> Option<Duration> {
    timeout.map(Duration::from_secs)
}

/// Runs the dependency phase of `depend` in `dir`.
pub async fn resolve(
    depend: &DependSpec,
    dir: &Path,
    python: &str,
    grace: Duration,
) -> RunResult<()> {
    if depend.is_empty() {
        return Ok(());
    }
    check_sources(depend)?;
    tracing::info!("Resolving dependencies in {}", dir.display());

    uninstall(depend, dir, python, grace).await?;
    for file in &depend.files {
        download(file, dir).await?;
    }
    for argv in install_commands(depend, python)? {
        let invocation =
            Invocation::new(argv, dir).with_timeout(secs(depend.pip_install_timeout));
        run_step(&invocation, grace).await?;
    }
    Ok(())
}

async fn uninstall(
    depend: &DependSpec,
    dir: &Path,
    python: &str,
    grace: Duration,
) -> RunResult<()> {
    if depend.uninstall.is_empty() {
        return Ok(());
    }

    let mut list = tempfile::Builder::new()
        .prefix(".yea-uninstall-")
        .suffix(".txt")
        .tempfile_in(dir)?;
    for package in &depend.uninstall {
        writeln!(list, "{package}")?;
    }
    list.flush()?;

    let mut argv = pip_argv(python, "uninstall");
    argv.extend(["-qq", "-y", "-r"].map(String::from));
    argv.push(list.path().to_string_lossy().into_owned());

    let invocation = Invocation::new(argv, dir).with_timeout(secs(depend.pip_uninstall_timeout));
    run_step(&invocation, grace).await
}

async fn run_step(invocation: &Invocation, grace: Duration) -> RunResult<()> {
    let outcome = process::run(invocation, grace).await?;
    if outcome.success() {
        return Ok(());
    }
    let reason = if outcome.timed_out {
        "timed out".to_string()
    } else {
        match outcome.exit_code {
            Some(code) => format!("exit code {code}"),
            None => format!("killed by signal {:?}", outcome.signal),
        }
    };
    Err(RunError::Dependency {
        command: invocation.display(),
        reason,
    })
}

async fn download(dep: &FileDependency, dir: &Path) -> RunResult<()> {
    let url = dep.source.clone();
    let dest = dir.join(&dep.file);
    tracing::info!("Downloading {} from {}", dep.file, url);

    let task_url = url.clone();
    tokio::task::spawn_blocking(move || fetch(&task_url, &dest))
        .await
        .map_err(|e| RunError::Download {
            url: url.clone(),
            reason: e.to_string(),
        })?
        .map_err(|reason| RunError::Download { url, reason })
}

fn fetch(url: &str, dest: &Path) -> Result<(), String> {
    let resp = ureq::get(url).call().map_err(|e| e.to_string())?;
    let mut reader = resp.into_body().into_reader();

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let mut file = std::fs::File::create(dest)
        .map_err(|e| format!("create {}: {e}", dest.display()))?;
    std::io::copy(&mut reader, &mut file).map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn depend(yaml: &str) -> DependSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_install_commands() {
        let d = depend("requirements: [numpy, '-e ../lib']\n");
        assert_eq!(
            install_commands(&d, "python3").unwrap(),
            vec![
                vec!["python3", "-m", "pip", "install", "-qq", "numpy"],
                vec!["python3", "-m", "pip", "install", "-qq", "-e", "../lib"],
            ]
        );

        let d = depend("requirements: [torch]\npip_install_options: [--no-deps, -q]\n");
        assert_eq!(
            install_commands(&d, "python").unwrap(),
            vec![vec!["python", "-m", "pip", "install", "--no-deps", "-q", "torch"]]
        );
    }

    #[test]
    fn test_check_sources() {
        let ok = depend("files:\n  - file: a.csv\n    source: https://example.com/a.csv\n");
        assert!(check_sources(&ok).is_ok());

        let bad = depend(
            "files:\n  - file: a.csv\n    source: https://example.com/a.csv\n  - file: b.csv\n    source: s3://bucket/b.csv\n",
        );
        let err = check_sources(&bad).unwrap_err();
        assert!(matches!(err, RunError::UnsupportedSource { ref file, .. } if file == "b.csv"));
    }

    #[tokio::test]
    async fn test_bad_scheme_fails_before_any_step() {
        let tmp = TempDir::new().unwrap();
        let d = depend(
            "uninstall: [foo]\nfiles:\n  - file: x.bin\n    source: ftp://host/x.bin\n",
        );
        // `false` would fail the uninstall step if it ran.
        let err = resolve(&d, tmp.path(), "false", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::UnsupportedSource { .. }));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_step_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let d = depend("uninstall: [foo]\n");
        let err = resolve(&d, tmp.path(), "false", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Dependency { .. }));
        // The requirement list is removed afterwards.
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_steps() {
        let tmp = TempDir::new().unwrap();
        let d = depend("uninstall: [foo]\nrequirements: [bar, baz]\n");
        resolve(&d, tmp.path(), "true", Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_is_noop() {
        let tmp = TempDir::new().unwrap();
        resolve(&DependSpec::default(), tmp.path(), "false", Duration::from_secs(1))
            .await
            .unwrap();
    }
}
