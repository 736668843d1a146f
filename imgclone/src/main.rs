use anyhow::{Result, anyhow};
use clap::{ArgAction, Parser};
use clap::error::ErrorKind;
use console::style;
use imgclone_core::job::{DEFAULT_EXTRA_SPACE, DEFAULT_SOURCE};
use imgclone_core::tools::SystemHost;
use imgclone_core::{CloneJob, CloneObserver, CloneOrchestrator, Compression, Stage};
use indicatif::{ProgressBar, ProgressStyle};
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "imgclone", version)]
#[command(about = "Create a backup of your SD card to an image file")]
#[command(
    after_help = "Warning! the destination image file must be located on an external drive, \
                  you cannot back up to a file on the SD card!"
)]
struct Cli {
    /// Device to back up
    #[arg(short = 's', value_name = "source_device", default_value = DEFAULT_SOURCE)]
    source: PathBuf,

    /// Image file to write the backup to
    #[arg(short = 'd', value_name = "destination_file", required = true)]
    destination: PathBuf,

    /// Give the copy a new disk identifier (any value not starting with 0)
    #[arg(
        short = 'u',
        value_name = "0|1",
        action = ArgAction::Set,
        default_value = "0",
        value_parser = parse_switch
    )]
    new_uuid: bool,

    /// Extra bytes of free space to leave in the last partition
    #[arg(short = 'x', value_name = "bytes", default_value_t = DEFAULT_EXTRA_SPACE)]
    extra_space: u64,

    /// Print copy progress
    #[arg(short = 'p')]
    progress: bool,

    /// Compress the finished image with bzip2
    #[arg(long, overrides_with = "gzip")]
    bzip2: bool,

    /// Compress the finished image with gzip
    #[arg(long, overrides_with = "bzip2")]
    gzip: bool,
}

impl Cli {
    fn compression(&self) -> Compression {
        match (self.bzip2, self.gzip) {
            (_, true) => Compression::Gzip,
            (true, false) => Compression::Bzip2,
            (false, false) => Compression::None,
        }
    }
}

/// Anything other than a leading `0` turns the switch on.
fn parse_switch(value: &str) -> Result<bool, String> {
    Ok(!value.starts_with('0'))
}

/// Rewrites the single-dash long spellings to the ones clap understands.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| match arg.to_str() {
            Some("-bzip2") => OsString::from("--bzip2"),
            Some("-gzip") => OsString::from("--gzip"),
            Some("-?") => OsString::from("--help"),
            _ => arg,
        })
        .collect()
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("could not initialise logging: {e}"))
}

fn banner(title: &str) {
    let rule = "-".repeat(47);
    println!("{}", style(&rule).dim());
    println!("----    {}", style(title).bold());
    println!("{}", style(&rule).dim());
}

/// Renders the engine's progress events on the terminal.
#[derive(Default)]
struct Console {
    copy_line_done: bool,
    compress_bar: Option<ProgressBar>,
}

impl Console {
    fn compress_bar(total: u64) -> ProgressBar {
        let bar = ProgressBar::new(total);
        bar.set_prefix("Compressing");
        let bar_style = ProgressStyle::default_bar()
            .template(
                "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )
            .map(|s| s.progress_chars("■ "))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(bar_style);
        bar
    }
}

impl CloneObserver for Console {
    fn on_stage(&mut self, stage: Stage) {
        match stage {
            Stage::SizeEstimated => banner("ALLOCATING SPACE FOR .IMG FILE"),
            Stage::Provisioned => banner("CREATING PARTITIONS PLEASE WAIT"),
            Stage::Compressed => {
                if let Some(bar) = self.compress_bar.take() {
                    bar.finish_with_message("Compression complete.");
                }
            }
            _ => {}
        }
    }

    fn on_copy_start(&mut self, _ordinal: u32, index: usize, count: usize) {
        self.copy_line_done = false;
        println!("Copying partition {} of {count}...", index + 1);
        banner("COPYING FILES PLEASE WAIT");
    }

    fn on_copy_progress(&mut self, _ordinal: u32, percent: u8) {
        if self.copy_line_done {
            return;
        }
        print!("\r{percent}%");
        if percent >= 100 {
            println!();
            self.copy_line_done = true;
        }
        // Progress output is cosmetic.
        let _ = io::stdout().flush();
    }

    fn on_compress_progress(&mut self, done: u64, total: u64) {
        self.compress_bar
            .get_or_insert_with(|| Console::compress_bar(total))
            .set_position(done);
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    debug!(?cli, "parsed arguments");
    let compression = cli.compression();
    let job = CloneJob::new(
        cli.source,
        cli.destination,
        cli.new_uuid,
        cli.extra_space,
        cli.progress,
        compression,
    )?;

    println!(
        "Cloning {} to {}",
        style(job.source().display()).cyan(),
        style(job.destination().display()).cyan()
    );
    banner("READING PARTITIONS");

    let host = SystemHost::new();
    let mut console = Console::default();
    match CloneOrchestrator::new(&host).run(&job, &mut console) {
        Ok(report) => {
            println!(
                "Image size: {} bytes, {} partitions",
                report.size.required, report.partitions
            );
            if let Some(id) = &report.disk_id {
                println!("  Disk id: {}", style(id).cyan());
            }
            println!("  Output:  {}", style(report.output.display()).cyan());
            match &report.detach_warning {
                Some(reason) => println!(
                    "{} error releasing the image device: {reason}",
                    style("WARNING:").yellow().bold()
                ),
                None => println!("{}", style("Backup completed!").green().bold()),
            }
            info!(output = %report.output.display(), "backup finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("{} {e}", style("Error:").red().bold());
            Ok(ExitCode::from(e.exit_code()))
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    println!("{}", style("-".repeat(47)).dim());
    println!(
        "----    {}",
        style(format!("Raspberry Pi clone to image v{}", env!("CARGO_PKG_VERSION"))).bold()
    );
    println!("{}", style("-".repeat(47)).dim());
    println!(
        "{} Do not change files on your SD card while the backup is running.",
        style("WARNING:").red().bold()
    );
    println!(
        "{} The destination .img file must be on external storage or a network share.",
        style("WARNING:").red().bold()
    );
    println!();

    if let Err(e) = init_logging() {
        eprintln!("{} {e:#}", style("Error:").red().bold());
        return ExitCode::from(1);
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        let args = std::iter::once("imgclone")
            .chain(args.iter().copied())
            .map(OsString::from);
        Cli::try_parse_from(normalize_args(args))
    }

    #[test]
    fn single_dash_spellings_are_normalized() {
        let args = ["imgclone", "-bzip2", "-gzip", "-?", "-d", "-gzipped"].map(OsString::from);
        assert_eq!(
            normalize_args(args),
            ["imgclone", "--bzip2", "--gzip", "--help", "-d", "-gzipped"].map(OsString::from)
        );
    }

    #[test]
    fn defaults_apply() {
        let cli = parse(&["-d", "/mnt/usb/pi.img"]).unwrap();
        assert_eq!(cli.source, PathBuf::from("/dev/mmcblk0"));
        assert_eq!(cli.extra_space, 512 * 20480);
        assert!(!cli.new_uuid);
        assert!(!cli.progress);
        assert_eq!(cli.compression(), Compression::None);
    }

    #[test]
    fn uuid_switch_is_off_only_for_leading_zero() {
        for (value, expected) in [("0", false), ("00", false), ("1", true), ("yes", true)] {
            let cli = parse(&["-d", "pi.img", "-u", value]).unwrap();
            assert_eq!(cli.new_uuid, expected, "-u {value}");
        }
    }

    #[test]
    fn last_compression_flag_wins() {
        let cli = parse(&["-d", "pi.img", "-bzip2", "-gzip"]).unwrap();
        assert_eq!(cli.compression(), Compression::Gzip);
        let cli = parse(&["-d", "pi.img", "-gzip", "-bzip2"]).unwrap();
        assert_eq!(cli.compression(), Compression::Bzip2);
    }

    #[test]
    fn full_invocation() {
        let cli = parse(&["-s", "/dev/sda", "-d", "/mnt/nas/sda.img", "-x", "4096", "-p"]).unwrap();
        assert_eq!(cli.source, PathBuf::from("/dev/sda"));
        assert_eq!(cli.destination, PathBuf::from("/mnt/nas/sda.img"));
        assert_eq!(cli.extra_space, 4096);
        assert!(cli.progress);
    }

    #[test]
    fn question_mark_asks_for_help() {
        let err = parse(&["-?"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn missing_destination_is_an_argument_error() {
        let err = parse(&["-s", "/dev/mmcblk0"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn extra_space_must_be_a_number() {
        assert!(parse(&["-d", "pi.img", "-x", "-5"]).is_err());
        assert!(parse(&["-d", "pi.img", "-x", "lots"]).is_err());
    }
}
