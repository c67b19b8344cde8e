//! Update sessions across the Hactar's processors.
//!
//! One [`FlashOrchestrator`] owns the only [`SerialLink`] to the board. A run
//! walks the requested targets in a fixed order (mgmt, ui, net). For each
//! target it puts the board into the matching upload mode, reopens the port
//! at the parity that target's bootloader speaks, and hands the link to the
//! right protocol client.

use {
    crate::{
        error::{Error, Result},
        image::BinaryProvider,
        is_interrupted_requested,
        port::Parity,
        progress::{Phase, ProgressSink, StatusLine, VerifyProgress},
        protocol::READY,
        target::{
            Flasher, Target,
            esp32::{Esp32Client, Esp32Config},
            stm32::{EraseVerify, Stm32Client, Stm32Config},
        },
        transport::SerialLink,
    },
    log::{debug, warn},
    std::{fmt, str::FromStr, thread, time::Duration},
};

/// Set of targets to flash, parsed from strings like `ui+net`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadMode {
    mgmt: bool,
    ui: bool,
    net: bool,
}

impl Default for UploadMode {
    /// `ui+net`, a full application update.
    fn default() -> Self {
        Self {
            mgmt: false,
            ui: true,
            net: true,
        }
    }
}

impl UploadMode {
    /// A mode flashing only `target`.
    pub fn only(target: Target) -> Self {
        Self {
            mgmt: false,
            ui: false,
            net: false,
        }
        .with(target)
    }

    /// Add `target`.
    #[must_use]
    pub fn with(mut self, target: Target) -> Self {
        match target {
            Target::Mgmt => self.mgmt = true,
            Target::Ui => self.ui = true,
            Target::Net => self.net = true,
        }
        self
    }

    /// Whether `target` is part of the mode.
    pub fn contains(self, target: Target) -> bool {
        match target {
            Target::Mgmt => self.mgmt,
            Target::Ui => self.ui,
            Target::Net => self.net,
        }
    }

    /// Targets in flashing order.
    pub fn targets(self) -> Vec<Target> {
        Target::ALL
            .into_iter()
            .filter(|&t| self.contains(t))
            .collect()
    }
}

impl FromStr for UploadMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut mode = Self {
            mgmt: false,
            ui: false,
            net: false,
        };
        for part in s.split(['+', ',']) {
            let part = part.trim();
            if part.is_empty() {
                return Err(Error::Config(format!("empty target in upload mode '{s}'")));
            }
            let target = Target::from_name(part)
                .ok_or_else(|| Error::Config(format!("unknown target '{part}' in upload mode")))?;
            mode = mode.with(target);
        }
        Ok(mode)
    }
}

impl fmt::Display for UploadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .targets()
            .into_iter()
            .map(Target::name)
            .collect();
        f.write_str(&names.join("+"))
    }
}

/// Where a session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Nothing started yet.
    #[default]
    Idle,
    /// Switching the board into a target's upload mode.
    SelectingMode,
    /// Erasing flash.
    Erasing,
    /// Writing image data.
    Writing,
    /// Checking written data.
    Verifying,
    /// Every target flashed.
    Complete,
    /// The session stopped on an error.
    Failed,
}

impl SessionState {
    /// Whether the session is over.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl From<Phase> for SessionState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Erasing => Self::Erasing,
            Phase::Writing => Self::Writing,
            Phase::Verifying => Self::Verifying,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::SelectingMode => "selecting mode",
            Self::Erasing => "erasing",
            Self::Writing => "writing",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Progress of one run, sitting between the protocol clients and the
/// caller's sink.
///
/// Tracks the session state from the phases clients report and keeps every
/// status line of the run.
pub struct FlashSession<'s> {
    sink: &'s mut dyn ProgressSink,
    state: SessionState,
    target: Option<Target>,
    lines: Vec<StatusLine>,
}

impl<'s> FlashSession<'s> {
    /// A session forwarding to `sink`.
    pub fn new(sink: &'s mut dyn ProgressSink) -> Self {
        Self {
            sink,
            state: SessionState::Idle,
            target: None,
            lines: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Target being flashed.
    pub fn target(&self) -> Option<Target> {
        self.target
    }

    /// Status lines seen so far.
    pub fn lines(&self) -> &[StatusLine] {
        &self.lines
    }

    fn enter(&mut self, target: Target) {
        self.target = Some(target);
        self.state = SessionState::SelectingMode;
    }

    fn as_sink(&mut self) -> &mut dyn ProgressSink {
        self
    }
}

impl ProgressSink for FlashSession<'_> {
    fn status(&mut self, line: StatusLine) {
        self.lines
            .push(line.clone());
        self.sink
            .status(line);
    }

    fn verify(&mut self, progress: VerifyProgress) {
        self.sink
            .verify(progress);
    }

    fn percent(&mut self, stage: &str, percent: u8) {
        self.sink
            .percent(stage, percent);
    }

    fn phase(&mut self, phase: Phase) {
        self.state = phase.into();
        self.sink
            .phase(phase);
    }
}

/// Timing and client settings for a run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wait for the reply to an upload-mode command.
    pub selection_timeout: Duration,
    /// Sends of an upload-mode command.
    pub selection_retries: usize,
    /// Wait for each READY poll.
    pub ready_timeout: Duration,
    /// READY polls before giving up.
    pub ready_polls: usize,
    /// Pause between finishing ui and selecting net.
    pub settle_delay: Duration,
    /// Half-period of the mgmt RTS/DTR pulse.
    pub pulse_width: Duration,
    /// STM32 client settings.
    pub stm32: Stm32Config,
    /// ESP32 client settings.
    pub esp32: Esp32Config,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            selection_timeout: Duration::from_millis(4000),
            selection_retries: 5,
            ready_timeout: Duration::from_millis(5000),
            ready_polls: 5,
            settle_delay: Duration::from_millis(2000),
            pulse_width: Duration::from_millis(1),
            stm32: Stm32Config::default(),
            esp32: Esp32Config::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Set the pause before net selection.
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set how STM32 erases are checked.
    #[must_use]
    pub fn with_erase_verify(mut self, mode: EraseVerify) -> Self {
        self.stm32 = self
            .stm32
            .with_erase_verify(mode);
        self
    }
}

/// Drives update sessions over one serial link.
pub struct FlashOrchestrator {
    link: Option<SerialLink>,
    config: OrchestratorConfig,
    state: SessionState,
    log: Vec<StatusLine>,
}

impl FlashOrchestrator {
    /// Take ownership of `link`.
    pub fn new(link: SerialLink, config: OrchestratorConfig) -> Self {
        Self {
            link: Some(link),
            config,
            state: SessionState::Idle,
            log: Vec::new(),
        }
    }

    /// Whether the link survived the last run.
    ///
    /// A failed run drops the link; build a new orchestrator to retry.
    pub fn has_link(&self) -> bool {
        self.link
            .is_some()
    }

    /// State the last run ended in.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Status lines of the last run.
    pub fn log(&self) -> &[StatusLine] {
        &self.log
    }

    /// Flash every target in `mode`.
    ///
    /// Any failure stops the run, closes and drops the link and returns the
    /// error. Nothing already written is rolled back.
    pub fn run(
        &mut self,
        mode: UploadMode,
        provider: &dyn BinaryProvider,
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        let mut session = FlashSession::new(sink);
        let result = match self
            .link
            .as_mut()
        {
            Some(link) => run_targets(link, &self.config, mode, provider, &mut session),
            None => Err(Error::TransportClosed),
        };

        match &result {
            Ok(()) => {
                session.state = SessionState::Complete;
                session
                    .as_sink()
                    .info(format!("Update of {mode}: COMPLETE"));
            },
            Err(e) => {
                session.state = SessionState::Failed;
                let stage = session
                    .target
                    .map_or_else(|| "session".to_string(), |t| t.to_string());
                session
                    .as_sink()
                    .error(format!("Update of {stage} failed: {e}"));
                if let Some(mut link) = self
                    .link
                    .take()
                {
                    if let Err(close) = link.close() {
                        warn!("Failed to close {}: {close}", link.port_name());
                    }
                }
            },
        }

        self.state = session.state;
        self.log = session.lines;
        result
    }
}

fn run_targets(
    link: &mut SerialLink,
    config: &OrchestratorConfig,
    mode: UploadMode,
    provider: &dyn BinaryProvider,
    session: &mut FlashSession<'_>,
) -> Result<()> {
    let targets = mode.targets();
    if targets.is_empty() {
        return Err(Error::Config("no targets to flash".into()));
    }

    let mut settle = false;
    for target in targets {
        if is_interrupted_requested() {
            return Err(Error::Interrupted);
        }
        if target == Target::Net && settle {
            debug!("Waiting {:?} for the board to settle", config.settle_delay);
            thread::sleep(config.settle_delay);
        }

        session.enter(target);
        select_mode(link, config, target, session.as_sink())?;

        let sink = session.as_sink();
        if target.is_stm32() {
            let mut client = Stm32Client::new(link, config.stm32.clone());
            client.connect(sink)?;
            client.flash(target, provider, sink)?;
        } else {
            let mut client = Esp32Client::new(link, config.esp32.clone());
            client.connect(sink)?;
            client.flash(target, provider, sink)?;
        }

        link.close()?;
        settle = true;
    }
    Ok(())
}

/// Put the board into `target`'s upload mode and leave the link open at
/// that target's parity.
fn select_mode(
    link: &mut SerialLink,
    config: &OrchestratorConfig,
    target: Target,
    sink: &mut dyn ProgressSink,
) -> Result<()> {
    let label = target
        .name()
        .to_uppercase();
    let parity = target.parity();
    link.open(Parity::None)?;

    let Some(command) = target.selection_command() else {
        pulse_signals(link, config.pulse_width)?;
        link.open(parity)?;
        sink.info(format!("Activating {label} Upload Mode: SUCCESS"));
        sink.debug(format!("Update uart to parity: {parity}"));
        return Ok(());
    };

    send_selection(link, config, command, sink)?;
    link.open(parity)?;
    wait_ready(link, config, &label, sink)?;

    sink.info(format!("Activating {label} Upload Mode: SUCCESS"));
    sink.info(format!("Update uart to parity: {parity}"));
    Ok(())
}

fn send_selection(
    link: &mut SerialLink,
    config: &OrchestratorConfig,
    command: &[u8],
    sink: &mut dyn ProgressSink,
) -> Result<()> {
    let name = String::from_utf8_lossy(command);
    let retries = config
        .selection_retries
        .max(1);
    for attempt in 1..=retries {
        link.write_bytes(command)?;
        if let Some(reply) = link.read_byte(config.selection_timeout) {
            debug!("Reply {reply:#04x} to {name}");
            return Ok(());
        }
        sink.warning(format!("No reply to {name} (attempt {attempt}/{retries})"));
    }

    sink.error("Failed to move Hactar into upload mode");
    Err(Error::no_reply(format!("Sending {name}")))
}

fn wait_ready(
    link: &mut SerialLink,
    config: &OrchestratorConfig,
    label: &str,
    sink: &mut dyn ProgressSink,
) -> Result<()> {
    for _ in 0..config.ready_polls {
        if is_interrupted_requested() {
            return Err(Error::Interrupted);
        }
        match link.read_byte(config.ready_timeout) {
            Some(READY) => return Ok(()),
            Some(other) => sink.warning(format!(
                "Unexpected byte {other:#04x} while waiting for {label} upload mode, retrying..."
            )),
            None => sink.warning(format!(
                "Failed to get Hactar into {label} upload mode, retrying..."
            )),
        }
    }

    sink.error("Hactar took too long to get ready");
    Err(Error::no_reply(format!("Waiting for {label} upload mode")))
}

/// Set RTS and DTR low, invert them, then restore them.
fn pulse_signals(link: &mut SerialLink, width: Duration) -> Result<()> {
    link.set_rts(false)?;
    link.set_dtr(false)?;
    thread::sleep(width);
    link.set_rts(true)?;
    link.set_dtr(true)?;
    thread::sleep(width);
    link.set_rts(false)?;
    link.set_dtr(false)
}
