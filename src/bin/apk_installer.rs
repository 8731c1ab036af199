use anyhow::{bail, Context, Result};
use apk_installer::core::{
    archive::package::read_package_info,
    config::{parse_config, InstallerConfig},
    install::{InstallationEvent, Installer, StagingInstaller},
    logging::init_logging,
    signing::{verify, ArchiveSigner},
};
use apk_installer::CONFIG_FILE;
use std::{path::PathBuf, sync::Arc, thread};

const USAGE: &str = "Usage:
  apk-installer sign <input> <output> [--config PATH]
  apk-installer verify <archive> [--config PATH]
  apk-installer info <archive> [--config PATH]
  apk-installer install <archive> --package ID --staging DIR [--config PATH]";

struct Args {
    command: String,
    positional: Vec<PathBuf>,
    config: PathBuf,
    package: Option<String>,
    staging: Option<PathBuf>,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = std::env::args().skip(1);
    let command = match args.next() {
        Some(arg) if arg == "-h" || arg == "--help" => return Ok(None),
        Some(command) => command,
        None => bail!("missing command\n{USAGE}"),
    };
    let mut parsed = Args {
        command,
        positional: vec![],
        config: PathBuf::from(CONFIG_FILE),
        package: None,
        staging: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                parsed.config =
                    PathBuf::from(args.next().context("`--config` requires a path argument")?);
            }
            "--package" => {
                parsed.package = Some(args.next().context("`--package` requires an identifier")?);
            }
            "--staging" => {
                parsed.staging = Some(PathBuf::from(
                    args.next().context("`--staging` requires a path argument")?,
                ));
            }
            "-h" | "--help" => return Ok(None),
            flag if flag.starts_with("--") => bail!("unknown argument: {arg}"),
            _ => parsed.positional.push(PathBuf::from(arg)),
        }
    }
    Ok(Some(parsed))
}

fn positional<const N: usize>(args: &Args) -> Result<[PathBuf; N]> {
    match <[PathBuf; N]>::try_from(args.positional.clone()) {
        Ok(paths) => Ok(paths),
        Err(_) => bail!(
            "`{}` takes {} path argument(s), got {}\n{USAGE}",
            args.command,
            N,
            args.positional.len()
        ),
    }
}

fn sign(config: &InstallerConfig, args: &Args) -> Result<()> {
    let [input, output] = positional::<2>(args)?;
    let signed = ArchiveSigner::from_config(&config.signing)
        .sign(&input, &output)
        .with_context(|| format!("failed to sign {}", input.display()))?;
    println!(
        "{}: {} entries, signer {}",
        signed.path.display(),
        signed.entries,
        signed.fingerprint
    );
    Ok(())
}

fn verify_archive(args: &Args) -> Result<()> {
    let [archive] = positional::<1>(args)?;
    let verified =
        verify(&archive).with_context(|| format!("{} failed verification", archive.display()))?;
    println!(
        "{}: {} entries verified, signer {}",
        archive.display(),
        verified.entries,
        verified.fingerprint
    );
    Ok(())
}

fn info(args: &Args) -> Result<()> {
    let [archive] = positional::<1>(args)?;
    let info = read_package_info(&archive)
        .with_context(|| format!("failed to read {}", archive.display()))?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn install(config: &InstallerConfig, args: &Args) -> Result<()> {
    let [archive] = positional::<1>(args)?;
    let package = args
        .package
        .as_deref()
        .context("`install` requires --package")?;
    let staging = args
        .staging
        .as_ref()
        .context("`install` requires --staging")?;
    let platform = StagingInstaller::new(staging)
        .with_context(|| format!("cannot use {} as staging directory", staging.display()))?;

    let installer = Installer::from_config(config, Arc::new(platform));
    let purged = installer.purge_stale_artifacts()?;
    if purged > 0 {
        log::info!("Removed {} stale signed copies", purged);
    }
    let subscription = installer.subscribe();
    let printer = thread::spawn(move || -> Result<()> {
        for event in subscription.events.iter() {
            println!("{}", serde_json::to_string(&event)?);
            if matches!(event, InstallationEvent::Finished(_)) {
                break;
            }
        }
        Ok(())
    });

    let result = installer
        .begin(&archive, package)?
        .wait()
        .context("installation ended without a result")?;
    match printer.join() {
        Ok(printed) => printed?,
        Err(_) => bail!("event printer panicked"),
    }
    if !result.success {
        bail!("{}", result.message);
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging();
    let Some(args) = parse_args()? else {
        println!("{USAGE}");
        return Ok(());
    };
    let config = parse_config(&args.config);
    match args.command.as_str() {
        "sign" => sign(&config, &args),
        "verify" => verify_archive(&args),
        "info" => info(&args),
        "install" => install(&config, &args),
        other => bail!("unknown command: {other}\n{USAGE}"),
    }
}
