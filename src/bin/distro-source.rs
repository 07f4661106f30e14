use std::path::Path;

use anyhow::{bail, Context, Result};
use distro_source::config::{Config, SourceConfig, SyncMode};
use distro_source::extract::mount::SystemMounter;
use distro_source::extract::tree::{MirrorSync, RsyncSync, TreeSync};
use distro_source::extract::Extractor;
use distro_source::fetch::transport::HttpTransport;
use distro_source::source::VerificationPlan;
use distro_source::{preflight, resolve, Fetcher, GpgVerifier, Pipeline, SourceDescriptor};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  distro-source run <config.toml> <rootfs_dir>\n  distro-source resolve <config.toml>\n  distro-source preflight <config.toml>"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, config, rootfs] if cmd == "run" => run(Path::new(config), Path::new(rootfs)),
        [cmd, config] if cmd == "resolve" => print_resolved(Path::new(config)),
        [cmd, config] if cmd == "preflight" => {
            let config = Config::load(Path::new(config))?;
            preflight::check_config(&config)?;
            println!("[preflight] all required host tools present");
            Ok(())
        }
        _ => bail!(usage()),
    }
}

fn run(config_path: &Path, rootfs: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    preflight::check_config(&config)
        .with_context(|| format!("preflight for '{}'", config_path.display()))?;
    let descriptor = descriptor_for(&config)?;

    std::fs::create_dir_all(&config.cache_dir)
        .with_context(|| format!("creating cache directory '{}'", config.cache_dir.display()))?;
    let fetcher = Fetcher::http(&config.cache_dir);
    let verifier = GpgVerifier::new();
    let sync: &dyn TreeSync = match config.sync {
        SyncMode::Builtin => &MirrorSync,
        SyncMode::Rsync => &RsyncSync,
    };
    let extractor =
        Extractor::new(&SystemMounter, sync, &config.cache_dir).with_layout(config.layout.clone());

    let outcome = match Pipeline::new(&fetcher, &verifier, extractor).run(&descriptor, rootfs) {
        Ok(outcome) => outcome,
        Err(err) => {
            for warning in &err.warnings {
                eprintln!("[cleanup] {warning}");
            }
            return Err(err).with_context(|| {
                format!(
                    "acquiring '{}' into '{}'",
                    descriptor.image,
                    rootfs.display()
                )
            });
        }
    };

    for warning in &outcome.warnings {
        eprintln!("[cleanup] {warning}");
    }
    println!(
        "[run] {} unpacked from {} into {}",
        descriptor.image,
        outcome.image.display(),
        outcome.rootfs.display()
    );
    Ok(())
}

fn print_resolved(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let descriptor = descriptor_for(&config)?;
    let resolved = resolve(&descriptor)
        .with_context(|| format!("resolving source from '{}'", config_path.display()))?;

    println!("image:     {}", resolved.image_url);
    match &resolved.plan {
        VerificationPlan::Skip => println!("plan:      skip (no verification)"),
        VerificationPlan::Checksum {
            manifest_url,
            algorithm,
        } => {
            println!("plan:      checksum ({algorithm}, manifest trusted via https)");
            println!("manifest:  {manifest_url}");
        }
        VerificationPlan::Signed {
            manifest_url,
            signature_url,
            algorithm,
            keyring,
        } => {
            println!("plan:      signed ({algorithm})");
            println!("manifest:  {manifest_url}");
            println!("signature: {signature_url}");
            println!("keys:      {} via {}", keyring.keys.join(", "), keyring.keyserver);
        }
    }
    Ok(())
}

fn descriptor_for(config: &Config) -> Result<SourceDescriptor> {
    config.descriptor(&HttpTransport).with_context(|| match &config.source {
        SourceConfig::GithubLatest { release, .. } => {
            format!("looking up latest release of {}/{}", release.owner, release.repo)
        }
        SourceConfig::Fixed(_) => format!("reading source from '{}'", config.path.display()),
    })
}
