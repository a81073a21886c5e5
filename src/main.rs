use std::path::PathBuf;
use std::process;

use clap::Parser;
use ddisign::manifest::DEFAULT_XCODE_PATH;
use ddisign::{parse_u64, personalize_ddi, SignOptions};
use log::LevelFilter;

/// Personalize a Developer Disk Image (DDI) for one device.
///
/// The BuildManifest comes from the iOS_DDI.dmg inside Xcode (mounted and
/// detached automatically) or from an explicit --manifest file.
#[derive(Parser, Debug)]
#[command(name = "ddi-sign", version, about = "Personalize DDI")]
struct Cli {
    /// Path to Xcode.app [default: /Applications/Xcode.app unless --manifest is given]
    #[arg(short = 'x', long = "xcode")]
    xcode: Option<PathBuf>,

    /// BuildManifest.plist to use
    #[arg(short = 'm', long = "manifest")]
    manifest: Option<PathBuf>,

    /// Device ApBoardID (decimal or 0x-hex)
    #[arg(short = 'b', long = "board-id", value_parser = parse_id)]
    board_id: Option<u64>,

    /// Device ApChipID (decimal or 0x-hex)
    #[arg(short = 'c', long = "chip-id", value_parser = parse_id)]
    chip_id: Option<u64>,

    /// Device ApECID (decimal or 0x-hex)
    #[arg(short = 'e', long = "ecid", value_parser = parse_id)]
    ecid: Option<u64>,

    /// Device ApNonce (hex)
    #[arg(short = 'n', long = "nonce")]
    nonce: Option<String>,

    /// HTTP/HTTPS proxy
    #[arg(long = "proxy")]
    proxy: Option<String>,

    /// Do not verify TLS certificates
    #[arg(long = "insecure")]
    insecure: bool,

    /// Folder to write signature to
    #[arg(short = 'o', long = "output", value_hint = clap::ValueHint::DirPath)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

fn parse_id(s: &str) -> Result<u64, String> {
    parse_u64(s).map_err(|e| e.to_string())
}

fn init_logging(cli: &Cli) {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .parse_default_env()
        .init();
}

impl Cli {
    fn into_options(self) -> SignOptions {
        // The Xcode default only applies when no manifest was given, so that
        // `--manifest` alone is not a conflict.
        let xcode = if self.xcode.is_none() && self.manifest.is_none() {
            Some(PathBuf::from(DEFAULT_XCODE_PATH))
        } else {
            self.xcode
        };
        SignOptions {
            xcode,
            manifest: self.manifest,
            board_id: self.board_id,
            chip_id: self.chip_id,
            ecid: self.ecid,
            nonce: self.nonce,
            proxy: self.proxy,
            insecure: self.insecure,
            output: self.output,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    match personalize_ddi(cli.into_options()) {
        Ok(path) => log::debug!("signature written to {}", path.display()),
        Err(e) => {
            eprintln!("ddi-sign: {}", e);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ddi-sign").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn xcode_default_only_without_manifest() {
        let opts = parse(&["-b", "0x0C", "-c", "33027", "-e", "1", "-n", "ab"]).into_options();
        assert_eq!(opts.xcode, Some(PathBuf::from(DEFAULT_XCODE_PATH)));
        assert_eq!(opts.board_id, Some(0x0C));
        assert_eq!(opts.chip_id, Some(0x8103));

        let opts = parse(&["--manifest", "BuildManifest.plist"]).into_options();
        assert_eq!(opts.xcode, None);

        let opts = parse(&["-x", "/Applications/Xcode-beta.app", "-m", "m.plist"]).into_options();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_bad_ids() {
        assert!(Cli::try_parse_from(["ddi-sign", "--ecid", "0xnope"]).is_err());
    }
}
