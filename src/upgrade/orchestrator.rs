//! End-to-end upgrade workflow.
//!
//! Composes device discovery, image parsing and the bootloader session:
//! 1. Scan - find exactly one robot
//! 2. Parse - read and validate the hex image
//! 3. Confirm - warn the user before anything destructive
//! 4. Transfer - connect, erase, write, verify, reset
//!
//! The first failure stops the sequence. Declining the confirmation is the
//! only way to back out, and the robot is never opened in that case.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::device::{resolve_single, scan, DeviceHandle};
use super::error::{BootloaderError, UpgradeError};
use super::hex::{parse, parse_file, FirmwareImage};
use super::session::{BootloaderSession, SessionState, VerifyOutcome};
use super::transport::Transport;
use crate::settings::UpgraderSettings;

/// Upgrade progress stages for UI feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data")]
pub enum UpgradeStage {
    /// Looking for robots.
    Scanning,
    /// Exactly one robot found.
    DeviceFound { label: String, port: String },
    /// Reading the hex image.
    ParsingImage,
    /// Waiting for the user to confirm.
    AwaitingConfirmation,
    /// Switching the robot into its bootloader.
    Connecting,
    /// Erasing flash.
    Erasing,
    /// Writing pages.
    Writing { written: usize, total: usize },
    /// Comparing page checksums.
    Verifying,
    /// Verification not done.
    VerifySkipped,
    /// Restarting the robot.
    Resetting,
    /// Upgrade complete.
    Complete,
    /// Log message.
    Log { message: String },
}

impl UpgradeStage {
    /// Get a percentage estimate for this stage.
    pub fn percent(&self) -> f32 {
        match self {
            UpgradeStage::Scanning => 0.0,
            UpgradeStage::DeviceFound { .. } => 2.0,
            UpgradeStage::ParsingImage => 4.0,
            UpgradeStage::AwaitingConfirmation => 6.0,
            UpgradeStage::Connecting => 8.0,
            UpgradeStage::Erasing => 12.0,
            UpgradeStage::Writing { written, total } => {
                if *total == 0 {
                    15.0
                } else {
                    15.0 + (*written as f32 / *total as f32) * 75.0
                }
            }
            UpgradeStage::Verifying => 92.0,
            UpgradeStage::VerifySkipped => 95.0,
            UpgradeStage::Resetting => 97.0,
            UpgradeStage::Complete => 100.0,
            // Log messages don't affect progress percentage
            UpgradeStage::Log { .. } => -1.0,
        }
    }

    /// Get a human-readable message for this stage.
    pub fn message(&self) -> String {
        match self {
            UpgradeStage::Scanning => "Looking for Thymio II...".into(),
            UpgradeStage::DeviceFound { label, .. } => format!("Found {}", label),
            UpgradeStage::ParsingImage => "Reading firmware image...".into(),
            UpgradeStage::AwaitingConfirmation => "Waiting for confirmation...".into(),
            UpgradeStage::Connecting => "Connecting to bootloader...".into(),
            UpgradeStage::Erasing => "Erasing flash...".into(),
            UpgradeStage::Writing { written, total } => {
                let percent = if *total == 0 {
                    0
                } else {
                    (written * 100) / total
                };
                format!("Writing firmware... {}%", percent)
            }
            UpgradeStage::Verifying => "Verifying firmware...".into(),
            UpgradeStage::VerifySkipped => "Verification skipped".into(),
            UpgradeStage::Resetting => "Restarting robot...".into(),
            UpgradeStage::Complete => "Update complete!".into(),
            UpgradeStage::Log { message } => message.clone(),
        }
    }
}

/// Terminal outcome of an upgrade attempt.
#[derive(Debug)]
pub enum UpgradeResult {
    Success,
    Failed(UpgradeError),
}

impl UpgradeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, UpgradeResult::Success)
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&UpgradeError> {
        match self {
            UpgradeResult::Success => None,
            UpgradeResult::Failed(e) => Some(e),
        }
    }
}

/// Where the firmware image comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    File(PathBuf),
    Text(String),
}

impl ImageSource {
    fn load(&self) -> Result<FirmwareImage, UpgradeError> {
        match self {
            ImageSource::File(path) => parse_file(path),
            ImageSource::Text(text) => Ok(parse(text)?),
        }
    }
}

/// Warning shown before the flash is touched.
pub fn confirmation_warning(device: &DeviceHandle) -> String {
    format!(
        "The firmware of {} is about to be replaced. \
         Make sure that the robot is charged and that the USB cable is properly connected. \
         Do not unplug the robot during the update! \
         If the update is interrupted the robot will not start until it is upgraded again.",
        device.label()
    )
}

#[derive(Debug, Default)]
struct SessionSlot {
    active: bool,
    port: Option<String>,
}

/// Exclusive claim on the session slot, released on drop.
struct SessionClaim<'a> {
    slot: &'a Mutex<SessionSlot>,
}

impl SessionClaim<'_> {
    fn set_port(&self, port: &str) {
        lock(self.slot).port = Some(port.to_string());
    }
}

impl Drop for SessionClaim<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = SessionSlot::default();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs upgrades, one at a time.
pub struct Upgrader<T: Transport> {
    transport: T,
    settings: UpgraderSettings,
    slot: Mutex<SessionSlot>,
    last_state: Mutex<Option<SessionState>>,
}

impl<T: Transport> Upgrader<T> {
    pub fn new(transport: T, settings: UpgraderSettings) -> Self {
        Self {
            transport,
            settings,
            slot: Mutex::new(SessionSlot::default()),
            last_state: Mutex::new(None),
        }
    }

    /// Current snapshot of connected robots.
    pub fn scan(&self) -> Vec<DeviceHandle> {
        scan(&self.transport, &self.settings.extra_usb_ids)
    }

    /// Port held by the upgrade in flight, if any.
    pub fn claimed_port(&self) -> Option<String> {
        lock(&self.slot).port.clone()
    }

    /// Final state of the most recent bootloader session.
    pub fn last_session_state(&self) -> Option<SessionState> {
        *lock(&self.last_state)
    }

    /// Upgrade the single connected robot with the given image.
    ///
    /// `confirm` receives the warning text and returns whether to proceed.
    pub fn upgrade<C, P>(&self, source: &ImageSource, mut confirm: C, on_progress: P) -> UpgradeResult
    where
        C: FnMut(&str) -> bool,
        P: Fn(UpgradeStage),
    {
        match self.run(source, &mut confirm, &on_progress) {
            Ok(()) => {
                log::info!("Upgrade complete");
                UpgradeResult::Success
            }
            Err(e) => {
                log::error!("Upgrade failed: {}", e);
                UpgradeResult::Failed(e)
            }
        }
    }

    fn claim(&self) -> Result<SessionClaim<'_>, UpgradeError> {
        let mut slot = lock(&self.slot);
        if slot.active {
            return Err(UpgradeError::Busy {
                port: slot
                    .port
                    .clone()
                    .unwrap_or_else(|| "a robot being scanned".to_string()),
            });
        }
        slot.active = true;
        Ok(SessionClaim { slot: &self.slot })
    }

    fn run(
        &self,
        source: &ImageSource,
        confirm: &mut dyn FnMut(&str) -> bool,
        on_progress: &dyn Fn(UpgradeStage),
    ) -> Result<(), UpgradeError> {
        let claim = self.claim()?;

        on_progress(UpgradeStage::Scanning);
        let device = resolve_single(self.scan())?;
        claim.set_port(device.address());
        on_progress(UpgradeStage::DeviceFound {
            label: device.label(),
            port: device.address().to_string(),
        });

        on_progress(UpgradeStage::ParsingImage);
        let image = source.load()?;
        let span = image.span().ok_or(UpgradeError::EmptyImage)?;
        log::info!(
            "Image has {} bytes in 0x{:08X}..0x{:08X}, sha256 {}",
            image.data_len(),
            span.start,
            span.end,
            image.sha256()
        );

        on_progress(UpgradeStage::AwaitingConfirmation);
        if !confirm(&confirmation_warning(&device)) {
            log::info!("Upgrade declined by user");
            return Err(UpgradeError::Cancelled);
        }

        let mut session = BootloaderSession::new(device, self.settings.session_config());
        let result = self.transfer(&mut session, &image, span, on_progress);
        *lock(&self.last_state) = Some(session.state());
        result
    }

    fn transfer(
        &self,
        session: &mut BootloaderSession,
        image: &FirmwareImage,
        span: std::ops::Range<u32>,
        on_progress: &dyn Fn(UpgradeStage),
    ) -> Result<(), UpgradeError> {
        on_progress(UpgradeStage::Connecting);
        log::info!("Upgrading {}", session.handle().label());
        session.connect(&self.transport)?;

        self.program(session, image, span, on_progress).map_err(|e| {
            if session.flash_touched() {
                UpgradeError::FlashInterrupted(e)
            } else {
                UpgradeError::Bootloader(e)
            }
        })
    }

    /// Erase, write, verify and reset a connected session.
    fn program(
        &self,
        session: &mut BootloaderSession,
        image: &FirmwareImage,
        span: std::ops::Range<u32>,
        on_progress: &dyn Fn(UpgradeStage),
    ) -> Result<(), BootloaderError> {
        let layout = session.layout().ok_or_else(|| {
            BootloaderError::Communication("bootloader sent no flash description".into())
        })?;

        on_progress(UpgradeStage::Erasing);
        session.erase(span)?;

        let pages = image.pages(layout.page_size as usize);
        let total = pages.len() * layout.page_size as usize;
        let mut written = 0;
        on_progress(UpgradeStage::Writing { written, total });
        for page in &pages {
            session.write_page(page.address, &page.data)?;
            written += page.data.len();
            on_progress(UpgradeStage::Writing { written, total });
        }

        if self.settings.verify {
            on_progress(UpgradeStage::Verifying);
            if session.verify()? == VerifyOutcome::Skipped {
                on_progress(UpgradeStage::VerifySkipped);
            }
        } else {
            on_progress(UpgradeStage::VerifySkipped);
        }

        on_progress(UpgradeStage::Resetting);
        session.reset_to_application()?;

        on_progress(UpgradeStage::Complete);
        Ok(())
    }
}
