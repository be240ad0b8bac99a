//! Helpers around the infrastructure driver binary (terraform or
//! terragrunt): working-directory argument handling, destroy invocations
//! and the startup init routine.

use tokio::process::Command as ProcessCommand;
use tracing::{error, info};

use crate::command::Command;
use crate::{Error, Result};

const INIT_ROUTINE: [&str; 2] = ["init", "plan"];

/// Extract the module working directory from driver-style argv:
/// `-chdir=<path>` for terraform, `--terragrunt-working-dir <path>` for
/// terragrunt.
pub fn module_path(args: &[String]) -> Option<&str> {
    let first = args.first()?;
    if let Some(path) = first.strip_prefix("-chdir=") {
        return Some(path);
    }
    if first == "--terragrunt-working-dir" {
        return args.get(1).map(|s| s.as_str());
    }
    None
}

/// Build the working-directory arguments for the given driver binary.
fn workdir_args(driver: &str, module: &str) -> Vec<String> {
    if driver.contains("terragrunt") {
        vec!["--terragrunt-working-dir".to_string(), module.to_string()]
    } else {
        vec![format!("-chdir={}", module)]
    }
}

/// Run a driver sub-command against a module with `-auto-approve`, logging
/// captured output.
pub async fn run(driver: &str, module: &str, subcommand: &str) -> Result<()> {
    let mut args = workdir_args(driver, module);
    args.push(subcommand.to_string());
    args.push("-auto-approve".to_string());
    exec(driver, module, subcommand, &args).await
}

async fn exec(driver: &str, module: &str, subcommand: &str, args: &[String]) -> Result<()> {
    info!("Running {} {} for module: {}", driver, subcommand, module);
    let output = ProcessCommand::new(driver).args(args).output().await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.trim().is_empty() {
        info!("{} stdout: {}", driver, stdout);
    }
    if !stderr.trim().is_empty() {
        error!("{} stderr: {}", driver, stderr);
    }

    if !output.status.success() {
        return Err(Error::Execution(format!(
            "error executing {} command {}: {}",
            driver, subcommand, output.status
        )));
    }
    Ok(())
}

/// Prepare every configured module at startup: run the init/plan routine in
/// background tasks so boot is not serialised on the driver.
pub fn init_modules(driver: &str, commands: &[Command]) {
    for cmd in commands {
        let Some(module) = module_path(&cmd.args) else {
            continue;
        };
        let driver = driver.to_string();
        let module = module.to_string();
        tokio::spawn(async move {
            for subcommand in INIT_ROUTINE {
                info!("Initiating driver directory for module: {}", module);
                let mut args = workdir_args(&driver, &module);
                args.push(subcommand.to_string());
                if let Err(e) = exec(&driver, &module, subcommand, &args).await {
                    error!("Error initiating module {}: {}", module, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_terraform_chdir() {
        let args = vec!["-chdir=/modules/web".to_string(), "apply".to_string()];
        assert_eq!(module_path(&args), Some("/modules/web"));
    }

    #[test]
    fn extracts_terragrunt_working_dir() {
        let args = vec![
            "--terragrunt-working-dir".to_string(),
            "/modules/web".to_string(),
            "apply".to_string(),
        ];
        assert_eq!(module_path(&args), Some("/modules/web"));
    }

    #[test]
    fn rejects_argv_without_module() {
        let args = vec!["apply".to_string()];
        assert_eq!(module_path(&args), None);
        assert_eq!(module_path(&[]), None);
    }
}
