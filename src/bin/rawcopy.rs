//! CLI tool for copying locked files from the raw NTFS volume.
//!
//! This tool uses the `rawcopy` library to resolve the file's extents,
//! optionally snapshot the volume, and copy the clusters straight from the
//! volume device.

#[cfg(any(windows, target_os = "linux"))]
mod cli {
    use clap::Parser;
    use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
    use once_cell::sync::Lazy;
    use rawcopy::{
        copy, inspect, CancelToken, CopyJob, CopyResult, NativeVolume, Options, Phase, Progress,
        ProgressReport,
    };
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;

    /// Cancelled by the console interrupt handler.
    static CANCEL: Lazy<CancelToken> = Lazy::new(CancelToken::new);

    /// Copy a file by reading its clusters directly from the NTFS volume.
    ///
    /// The file's extent table is resolved through the file system driver and
    /// every extent is read from the raw volume device, so files held open
    /// with exclusive sharing can still be copied. By default the volume is
    /// snapshotted first and the copy is read from the snapshot.
    #[derive(Parser, Debug)]
    #[command(name = "rawcopy")]
    #[command(author, version, about, long_about = None)]
    struct Args {
        /// Path to the file to copy
        source: PathBuf,

        /// Path of the copy
        destination: PathBuf,

        /// Replace the destination if it exists
        #[arg(long)]
        overwrite: bool,

        /// Read the live volume instead of a snapshot
        #[arg(long)]
        no_snapshot: bool,

        /// Transfer buffer size in KiB (multiple of 4)
        #[arg(long, default_value = "1024")]
        buffer_size_kb: u32,

        /// Number of extents copied concurrently
        #[arg(short = 'j', long, default_value = "1")]
        threads: usize,

        /// Copy files resident in the MFT through a regular read
        #[arg(long)]
        allow_fallback: bool,

        /// Fail any device read that takes longer than this many milliseconds
        #[arg(long)]
        read_timeout_ms: Option<u64>,

        /// Resolve extents and report what would be copied without copying
        #[arg(long)]
        dry_run: bool,

        /// Show volume geometry and the extent table
        #[arg(short, long)]
        verbose: bool,

        /// Hide the progress bar
        #[arg(short, long)]
        quiet: bool,
    }

    /// Renders copy progress as a byte progress bar.
    struct BarProgress {
        bar: ProgressBar,
    }

    impl BarProgress {
        fn new(quiet: bool) -> Self {
            let bar = ProgressBar::new(0);
            match ProgressStyle::default_bar().template(
                "{msg:<18} [{bar:40.green/white}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})",
            ) {
                Ok(style) => bar.set_style(style.progress_chars("=> ")),
                Err(e) => tracing::debug!("progress template rejected: {}", e),
            }
            if quiet {
                bar.set_draw_target(ProgressDrawTarget::hidden());
            }
            Self { bar }
        }
    }

    impl Progress for BarProgress {
        fn on_phase(&self, phase: Phase) {
            self.bar.set_message(phase.to_string());
        }

        fn on_start(&self, total_bytes: u64) {
            self.bar.set_length(total_bytes);
        }

        fn on_progress(&self, report: &ProgressReport) {
            self.bar.set_position(report.copied_bytes);
        }
    }

    pub fn main() {
        let args = Args::parse();
        init_logging(args.verbose);

        if let Err(e) = run(&args) {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    fn init_logging(verbose: bool) {
        let default = if verbose { "rawcopy=debug" } else { "rawcopy=warn" };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        if let Err(e) = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .try_init()
        {
            eprintln!("Warning: failed to initialize logging: {}", e);
        }
    }

    fn run(args: &Args) -> rawcopy::Result<()> {
        let options = Options::new()
            .with_buffer_size_kb(args.buffer_size_kb)
            .with_overwrite(args.overwrite)
            .with_snapshot(!args.no_snapshot)
            .with_allow_fallback(args.allow_fallback)
            .with_threads(args.threads)
            .with_read_timeout(args.read_timeout_ms.map(Duration::from_millis))
            .with_dry_run(args.dry_run);
        options.validate()?;

        // Raw device access needs root; a dry run only needs the extents.
        #[cfg(unix)]
        if !args.dry_run {
            sudo::escalate_if_needed().map_err(|e| {
                rawcopy::Error::io(
                    &args.source,
                    std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        format!("Failed to escalate privileges: {}", e),
                    ),
                )
            })?;
        }

        install_interrupt_handler();

        // Snapshot paths are derived from the volume root, which needs an
        // absolute source.
        let source =
            std::path::absolute(&args.source).map_err(|e| rawcopy::Error::io(&args.source, e))?;

        let volume = NativeVolume::default();
        if args.verbose {
            print_verbose_info(&volume, &source);
        }

        let progress = BarProgress::new(args.quiet);
        let job = CopyJob::new(source, &args.destination, options);
        let outcome = copy(&volume, &job, &progress, &CANCEL);
        progress.bar.finish_and_clear();
        let result = outcome?;

        if !args.quiet {
            print_summary(&result, args);
        }
        Ok(())
    }

    fn print_verbose_info(volume: &NativeVolume, path: &Path) {
        eprintln!("File: {}", path.display());

        let report = match inspect(volume, path) {
            Ok(report) => report,
            Err(e) => {
                eprintln!("Extents: (unable to resolve: {})", e);
                return;
            }
        };
        let info = &report.info;
        eprintln!("Volume: {}", info.root.display());
        eprintln!("Device: {}", info.device_path.display());
        eprintln!("Cluster size: {}", info.cluster_size);
        eprintln!("Sector size: {}", info.sector_size);
        eprintln!("Length: {} (0x{:x})", report.file_len, report.file_len);

        let table = &report.table;
        if table.is_empty() {
            eprintln!("Extents: none (data resident in the MFT record)");
            return;
        }

        eprintln!();
        eprintln!(
            "{:<6} {:<20} {:<20} {:<12} Offset",
            "Index", "VCN", "LCN", "Clusters"
        );
        eprintln!("{}", "-".repeat(80));
        let cs = table.cluster_size();
        for (i, extent) in table.iter().enumerate() {
            let lcn = match extent.lcn {
                Some(lcn) => format!("0x{:016x}", lcn),
                None => "hole".to_string(),
            };
            let offset = match extent.volume_offset(cs) {
                Some(offset) => format!("0x{:x}", offset),
                None => "-".to_string(),
            };
            eprintln!(
                "{:<6} 0x{:016x} {:<20} {:<12} {}",
                i, extent.starting_vcn, lcn, extent.cluster_count, offset
            );
        }
        eprintln!("{}", "-".repeat(80));
        eprintln!(
            "Total: {} extent(s), {} hole(s), {} bytes allocated",
            table.len(),
            table.hole_count(),
            table.allocated_bytes()
        );
        eprintln!();
    }

    fn print_summary(result: &CopyResult, args: &Args) {
        let verb = if args.dry_run { "Would copy" } else { "Copied" };
        eprintln!(
            "{} {} bytes ({} extent(s), {} hole(s)) in {:.2?}",
            verb, result.file_len, result.extent_count, result.hole_count, result.elapsed
        );
        if result.used_fallback {
            eprintln!("(Used fallback to regular file I/O)");
        } else {
            eprintln!("Device: {}", result.device_path.display());
        }
        if result.used_snapshot {
            eprintln!("Read from snapshot: {}", result.effective_source.display());
        }
    }

    #[cfg(unix)]
    fn install_interrupt_handler() {
        extern "C" fn on_interrupt(_signal: libc::c_int) {
            CANCEL.cancel();
        }

        Lazy::force(&CANCEL);
        // SAFETY: the handler only stores to an already initialized atomic.
        unsafe {
            libc::signal(
                libc::SIGINT,
                on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t,
            );
        }
    }

    #[cfg(windows)]
    fn install_interrupt_handler() {
        use winapi::shared::minwindef::{BOOL, DWORD, TRUE};
        use winapi::um::consoleapi::SetConsoleCtrlHandler;

        unsafe extern "system" fn on_console_event(_event: DWORD) -> BOOL {
            CANCEL.cancel();
            TRUE
        }

        Lazy::force(&CANCEL);
        // SAFETY: the handler only stores to an already initialized atomic.
        if unsafe { SetConsoleCtrlHandler(Some(on_console_event), TRUE) } == 0 {
            tracing::warn!(
                "failed to install console interrupt handler: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(any(windows, target_os = "linux"))]
fn main() {
    cli::main();
}

#[cfg(not(any(windows, target_os = "linux")))]
fn main() {
    eprintln!("Error: rawcopy supports Windows and Linux only");
    std::process::exit(1);
}
