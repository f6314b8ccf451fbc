//! `upgrade` command: flash a hex image onto the connected robot.

use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::upgrade::{
    ErrorKind, ImageSource, SessionState, Transport, UpgradeResult, UpgradeStage, Upgrader,
};

/// Exit code for a completed upgrade.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code for a failed upgrade.
pub const EXIT_FAILURE: u8 = 1;
/// Exit code when the user declined the warning.
pub const EXIT_CANCELLED: u8 = 2;

/// Progress event printed with `--json`.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeProgressEvent {
    /// Current stage name.
    pub stage: String,
    /// Bytes written (for writing stage).
    pub written: Option<usize>,
    /// Total bytes (for writing stage).
    pub total: Option<usize>,
    /// Progress percentage (0-100).
    pub percent: f32,
    /// Human-readable message.
    pub message: String,
}

impl From<UpgradeStage> for UpgradeProgressEvent {
    fn from(stage: UpgradeStage) -> Self {
        let (stage_name, written, total) = match &stage {
            UpgradeStage::Scanning => ("scanning", None, None),
            UpgradeStage::DeviceFound { .. } => ("found", None, None),
            UpgradeStage::ParsingImage => ("parsing", None, None),
            UpgradeStage::AwaitingConfirmation => ("confirming", None, None),
            UpgradeStage::Connecting => ("connecting", None, None),
            UpgradeStage::Erasing => ("erasing", None, None),
            UpgradeStage::Writing { written, total } => ("writing", Some(*written), Some(*total)),
            UpgradeStage::Verifying => ("verifying", None, None),
            UpgradeStage::VerifySkipped => ("verify-skipped", None, None),
            UpgradeStage::Resetting => ("resetting", None, None),
            UpgradeStage::Complete => ("complete", None, None),
            UpgradeStage::Log { .. } => ("log", None, None),
        };

        Self {
            stage: stage_name.to_string(),
            written,
            total,
            percent: stage.percent(),
            message: stage.message(),
        }
    }
}

/// Final line printed with `--json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeOutcome {
    pub success: bool,
    pub error_code: Option<String>,
    pub message: String,
    /// Final bootloader session state, absent when no session was opened.
    pub session_state: Option<SessionState>,
}

impl UpgradeOutcome {
    fn new(result: &UpgradeResult, session_state: Option<SessionState>) -> Self {
        match result {
            UpgradeResult::Success => Self {
                success: true,
                error_code: None,
                message: "Update complete!".into(),
                session_state,
            },
            UpgradeResult::Failed(e) => Self {
                success: false,
                error_code: Some(e.error_code().to_string()),
                message: e.user_message(),
                session_state,
            },
        }
    }
}

/// Image given on the command line; `-` reads it from stdin.
fn image_source(image: &Path) -> Result<ImageSource, String> {
    if image != Path::new("-") {
        return Ok(ImageSource::File(image.to_path_buf()));
    }
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .map_err(|e| format!("Failed to read image from stdin: {}", e))?;
    Ok(ImageSource::Text(text))
}

/// Process exit code for an upgrade result.
pub fn exit_code(result: &UpgradeResult) -> u8 {
    match result.error().map(|e| e.kind()) {
        None => EXIT_SUCCESS,
        Some(ErrorKind::Cancelled) => EXIT_CANCELLED,
        Some(_) => EXIT_FAILURE,
    }
}

/// Terminal renderer for progress stages.
struct ProgressRenderer {
    bar: ProgressBar,
}

impl ProgressRenderer {
    fn new() -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { bar }
    }

    fn render(&self, stage: UpgradeStage) {
        match stage {
            UpgradeStage::Log { message } => self.bar.println(message),
            UpgradeStage::Complete => self.bar.finish_with_message(stage.message()),
            stage => {
                let percent = stage.percent();
                if percent >= 0.0 {
                    self.bar.set_position(percent as u64);
                }
                self.bar.set_message(stage.message());
            }
        }
    }

    fn abandon(&self) {
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }
}

/// Ask the user to acknowledge the warning on the terminal.
fn confirm_on_terminal(warning: &str) -> bool {
    Confirm::new()
        .with_prompt(format!("{}\nProceed with the upgrade?", warning))
        .default(false)
        .interact()
        .unwrap_or(false)
}

/// Run an upgrade and report progress on the terminal.
pub async fn run<T>(
    upgrader: Arc<Upgrader<T>>,
    image: PathBuf,
    assume_yes: bool,
    json: bool,
) -> Result<u8, String>
where
    T: Transport + Sync + 'static,
{
    let source = image_source(&image)?;
    let session_upgrader = Arc::clone(&upgrader);

    // Create a channel for progress updates from the blocking thread
    let (tx, rx) = mpsc::channel::<UpgradeStage>();

    // Spawn a thread to render progress updates
    let progress_task = thread::spawn(move || {
        let renderer = (!json).then(ProgressRenderer::new);
        while let Ok(stage) = rx.recv() {
            match &renderer {
                Some(renderer) => renderer.render(stage),
                None => {
                    if let Ok(line) = serde_json::to_string(&UpgradeProgressEvent::from(stage)) {
                        println!("{}", line);
                    }
                }
            }
        }
        if let Some(renderer) = renderer {
            renderer.abandon();
        }
    });

    // Run the upgrade in a blocking task
    let result = tokio::task::spawn_blocking(move || {
        upgrader.upgrade(
            &source,
            |warning| assume_yes || confirm_on_terminal(warning),
            |stage| {
                let _ = tx.send(stage);
            },
        )
    })
    .await
    .map_err(|e| format!("Upgrade task panicked: {}", e))?;

    // Wait for progress rendering to complete
    let _ = progress_task.join();

    let session_state = session_upgrader.last_session_state();
    if let Some(state) = session_state {
        log::debug!("Bootloader session ended in state {:?}", state);
    }

    if json {
        let outcome = serde_json::to_string(&UpgradeOutcome::new(&result, session_state))
            .map_err(|e| format!("Failed to serialize outcome: {}", e))?;
        println!("{}", outcome);
    } else {
        match &result {
            UpgradeResult::Success => println!("Update complete!"),
            UpgradeResult::Failed(e) if e.kind() == ErrorKind::Cancelled => {
                println!("Upgrade cancelled, the robot was not modified")
            }
            UpgradeResult::Failed(e) => eprintln!("{}", e.user_message()),
        }
    }

    Ok(exit_code(&result))
}
