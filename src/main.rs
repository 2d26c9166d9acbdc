use std::{path::PathBuf, process::ExitCode};

use anyhow::{bail, Context, Result};
use model_cache::{core::logging, ModelManager, Settings};
use tracing::debug;

const USAGE: &str = "usage:
  model-cache url <URL> [PATH]
  model-cache hf <owner/name[:tag]>
  model-cache oci <[namespace/]name[:tag]>
  model-cache list";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Url { url: String, path: Option<PathBuf> },
    Hub(String),
    Oci(String),
    List,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some((command, rest)) = args.split_first() else {
        bail!("missing command\n{USAGE}");
    };
    let command = match (command.as_str(), rest) {
        ("url", [url]) => Command::Url {
            url: url.clone(),
            path: None,
        },
        ("url", [url, path]) => Command::Url {
            url: url.clone(),
            path: Some(PathBuf::from(path)),
        },
        ("hf", [reference]) => Command::Hub(reference.clone()),
        ("oci", [reference]) => Command::Oci(reference.clone()),
        ("list", []) => Command::List,
        _ => bail!("unrecognized arguments: {}\n{USAGE}", args.join(" ")),
    };
    Ok(command)
}

fn run(command: Command) -> Result<()> {
    let settings = Settings::from_env().context("load settings")?;
    debug!("cache directory: {}", settings.cache_dir.display());
    let manager = ModelManager::new(settings)?;

    match command {
        Command::Url { url, path } => {
            let path = manager.pull_url(&url, path.as_deref())?;
            println!("{}", path.display());
        }
        Command::Hub(reference) => {
            let model = manager.pull_hub(&reference)?;
            println!("{}", model.model_path.display());
            if let Some(mmproj) = model.mmproj_path {
                println!("{}", mmproj.display());
            }
        }
        Command::Oci(reference) => {
            let path = manager.pull_oci(&reference)?;
            println!("{}", path.display());
        }
        Command::List => {
            for model in manager.list_cached()? {
                println!("{}\t{}", model.reference(), model.size);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    logging::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args).and_then(run) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parses_each_command() {
        assert_eq!(
            parse_args(&args(&["url", "https://h/m.gguf"])).unwrap(),
            Command::Url {
                url: "https://h/m.gguf".into(),
                path: None
            }
        );
        assert_eq!(
            parse_args(&args(&["url", "https://h/m.gguf", "out.gguf"])).unwrap(),
            Command::Url {
                url: "https://h/m.gguf".into(),
                path: Some(PathBuf::from("out.gguf"))
            }
        );
        assert_eq!(
            parse_args(&args(&["hf", "acme/model:Q4_K_M"])).unwrap(),
            Command::Hub("acme/model:Q4_K_M".into())
        );
        assert_eq!(
            parse_args(&args(&["oci", "smollm2"])).unwrap(),
            Command::Oci("smollm2".into())
        );
        assert_eq!(parse_args(&args(&["list"])).unwrap(), Command::List);
    }

    #[test]
    fn rejects_unknown_or_incomplete_commands() {
        for bad in [&[][..], &["hf"][..], &["list", "extra"][..], &["pull", "x"][..]] {
            assert!(parse_args(&args(bad)).is_err());
        }
    }
}
