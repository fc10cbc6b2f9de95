//! Flash command implementation

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use stkbridge_core::config::SessionConfig;
use stkbridge_core::link::PeerLink;
use stkbridge_core::progress::ProgressObserver;
use stkbridge_core::{ProgrammingSession, ProgrammingState, ProgressSnapshot};

/// Create the flash progress bar style
fn create_progress_bar_style() -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")?
        .progress_chars("#>-"))
}

/// Renders session snapshots as an indicatif progress bar
pub struct IndicatifProgress {
    bar: ProgressBar,
    state: ProgrammingState,
}

impl IndicatifProgress {
    pub fn new(total_bytes: usize) -> Self {
        let bar = ProgressBar::new(total_bytes as u64);
        bar.set_style(create_progress_bar_style().unwrap_or_else(|_| ProgressStyle::default_bar()));
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            state: ProgrammingState::Idle,
        }
    }
}

impl ProgressObserver for IndicatifProgress {
    fn on_update(&mut self, snapshot: &ProgressSnapshot) {
        if snapshot.state != self.state {
            self.state = snapshot.state;
            let message = match snapshot.state {
                ProgrammingState::Connecting => "Connecting",
                ProgrammingState::Uploading => "Writing",
                ProgrammingState::Verifying => "Verifying",
                _ => "",
            };
            self.bar.set_message(message);
        }

        self.bar.set_position(snapshot.bytes_written as u64);

        match snapshot.state {
            ProgrammingState::Complete => self.bar.finish_with_message("Flash complete"),
            ProgrammingState::Error => self
                .bar
                .abandon_with_message(format!("Failed: {}", snapshot.error_message)),
            _ => {}
        }
    }
}

/// Program `data` into the peer behind `link`
///
/// Drives the session from a simple loop: feed what the session accepts,
/// then poll, until it reaches a terminal state.
pub fn run_flash<L: PeerLink>(
    link: L,
    config: &SessionConfig,
    data: &[u8],
) -> Result<(), Box<dyn std::error::Error>> {
    let progress = IndicatifProgress::new(data.len());
    let mut session = ProgrammingSession::with_observer(link, *config, progress)?;
    session.start(data.len())?;

    let mut offset = 0;
    let mut ended = false;
    loop {
        if offset < data.len() {
            match session.feed(&data[offset..]) {
                Ok(taken) => offset += taken,
                Err(e) => log::debug!("Upload refused: {}", e),
            }
        } else if !ended {
            ended = true;
            if let Err(e) = session.end_upload() {
                log::debug!("Upload end refused: {}", e);
            }
        }

        if session.poll().is_terminal() {
            break;
        }
    }

    // Parks the peer if the session failed mid-write
    session.poll();

    let progress = session.progress();
    if progress.state == ProgrammingState::Complete {
        println!(
            "Flashed and verified {} bytes ({} pages)",
            progress.bytes_total,
            session.pages_written()
        );
        Ok(())
    } else {
        Err(format!("Flashing failed: {}", progress.error_message).into())
    }
}
