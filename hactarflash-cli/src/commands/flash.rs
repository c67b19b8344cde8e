//! Flash command implementation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use hactarflash::{
    EraseVerify, FlashOrchestrator, NativeConnector, OrchestratorConfig, Phase, ProgressSink,
    SerialLink, Severity, StatusLine, Target, UploadMode, VerifyProgress,
};
use indicatif::{ProgressBar, ProgressStyle};

use crate::commands::firmware::FirmwareDir;
use crate::config::Config;
use crate::{Cli, CliError, get_port, use_fancy_output, was_interrupted};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Shows session progress on an indicatif bar.
///
/// Status lines reach the terminal through the `log` mirror; the bar only
/// carries the current step and percentage.
struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    fn new(hidden: bool) -> Self {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(100);
            #[allow(clippy::unwrap_used)] // Static template string
            bar.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] {prefix:>9} [{bar:40.cyan/blue}] {pos}% {msg}",
                    )
                    .unwrap()
                    .progress_chars("#>-"),
            );
            bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            bar
        };
        Self { bar }
    }
}

impl ProgressSink for BarSink {
    fn status(&mut self, line: StatusLine) {
        if line.replace_previous || line.severity == Severity::Info {
            self.bar
                .set_message(line.text);
        }
    }

    fn verify(&mut self, progress: VerifyProgress) {
        self.bar
            .set_position(u64::from(progress.percent));
    }

    fn percent(&mut self, _stage: &str, percent: u8) {
        self.bar
            .set_position(u64::from(percent));
    }

    fn phase(&mut self, phase: Phase) {
        let label = match phase {
            Phase::Erasing => "Erasing",
            Phase::Writing => "Writing",
            Phase::Verifying => "Verifying",
        };
        self.bar
            .set_prefix(label);
        self.bar
            .set_position(0);
    }
}

/// Upload mode from the flag, then configuration, then the default.
fn resolve_mode(arg: Option<&str>, config: &Config) -> Result<UploadMode> {
    match arg.or(config
        .flash
        .mode
        .as_deref())
    {
        Some(mode) => mode
            .parse()
            .map_err(|e: hactarflash::Error| CliError::Usage(e.to_string()).into()),
        None => Ok(UploadMode::default()),
    }
}

fn resolve_firmware_dir(arg: Option<&Path>, config: &Config) -> PathBuf {
    arg.map(Path::to_path_buf)
        .or_else(|| {
            config
                .flash
                .firmware_dir
                .clone()
        })
        .unwrap_or_else(|| PathBuf::from("."))
}

fn orchestrator_config(full_verify: bool, config: &Config) -> OrchestratorConfig {
    let mut settings = OrchestratorConfig::default();
    if full_verify
        || config
            .flash
            .full_erase_verify
    {
        settings = settings.with_erase_verify(EraseVerify::Full);
    }
    if let Some(ms) = config
        .flash
        .settle_delay_ms
    {
        settings = settings.with_settle_delay(Duration::from_millis(ms));
    }
    settings
}

fn confirm_mgmt_bootloader() -> Result<()> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Hold the management chip in bootloader mode. Continue?")
        .default(true)
        .interact_opt()
        .context("bootloader confirmation failed")?
        .unwrap_or(false);
    if confirmed {
        Ok(())
    } else {
        Err(CliError::Cancelled("mgmt upload cancelled".to_string()).into())
    }
}

fn print_plan(bundle: &FirmwareDir, mode: UploadMode) -> Result<()> {
    eprintln!(
        "{} Loading firmware from {}",
        style("📦").cyan(),
        bundle
            .root()
            .display()
    );
    for target in mode.targets() {
        let images = bundle
            .images_for(target)
            .with_context(|| format!("cannot load {target} firmware"))?;
        for image in images {
            eprintln!(
                "    {} {:<4} {} @ 0x{:08X} ({} bytes)",
                style("•").dim(),
                target,
                image.name,
                image.offset,
                image.len()
            );
        }
    }
    Ok(())
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    mode: Option<&str>,
    firmware_dir: Option<&Path>,
    full_verify: bool,
) -> Result<()> {
    let mode = resolve_mode(mode, config)?;
    let dir = resolve_firmware_dir(firmware_dir, config);
    let bundle = FirmwareDir::open(&dir)
        .map_err(|e| CliError::Config(format!("{e:#}")))?;

    if cli.quiet {
        // Images are still loaded up front so a broken bundle fails before
        // the board is touched.
        for target in mode.targets() {
            bundle.images_for(target)?;
        }
    } else {
        print_plan(&bundle, mode)?;
    }

    if mode.contains(Target::Mgmt) && !cli.non_interactive {
        confirm_mgmt_bootloader()?;
    }

    let port = get_port(cli, config)?;
    if !cli.quiet {
        eprintln!("{} Using port {port}", style("🔌").cyan());
    }
    ensure_not_interrupted()?;

    let link = SerialLink::new(Box::new(NativeConnector::new(port)));
    let mut orchestrator = FlashOrchestrator::new(link, orchestrator_config(full_verify, config));

    let mut sink = BarSink::new(cli.quiet || !use_fancy_output());
    let result = orchestrator.run(mode, &bundle, &mut sink);

    match result {
        Ok(()) => {
            sink.bar
                .finish_with_message("complete");
            if !cli.quiet {
                eprintln!(
                    "\n{} Update of {mode} completed",
                    style("🎉")
                        .green()
                        .bold()
                );
            }
            Ok(())
        },
        Err(err) => {
            sink.bar
                .abandon();
            Err(err.into())
        },
    }
}
