//! Local terminal verdict.
//!
//! The hook's stdin already carries the event JSON, so the prompt goes
//! straight to the controlling terminal device. When no terminal is
//! available (headless hosts, CI) the listener simply does not
//! participate in the race.

use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

const TTY_PATH: &str = "/dev/tty";

/// Handle to the terminal reader. Dropping it withdraws the listener
/// from the race; the reader thread notices on its next line.
pub struct TtyListener {
    verdicts: mpsc::Receiver<bool>,
    cancelled: Arc<AtomicBool>,
}

impl TtyListener {
    /// `Some(true)` approved, `Some(false)` rejected, `None` when the
    /// terminal went away.
    pub async fn recv(&mut self) -> Option<bool> {
        self.verdicts.recv().await
    }
}

impl Drop for TtyListener {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

/// Open the controlling terminal and start prompting. Returns `None`
/// with a one-line diagnostic when the terminal is unavailable.
pub fn spawn(masked_command: &str, severity: &str) -> Option<TtyListener> {
    let tty = match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(TTY_PATH)
    {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!("local terminal unavailable, remote approval only: {e}");
            return None;
        }
    };

    let (tx, rx) = mpsc::channel(1);
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancel_flag = cancelled.clone();
    let prompt = format!(
        "\ncmdgate: dangerous command blocked ({severity})\n  {masked_command}\nApprove? [y/n] "
    );

    std::thread::spawn(move || {
        let mut writer = tty.try_clone().ok();
        let mut reader = BufReader::new(tty);
        loop {
            if cancel_flag.load(Ordering::Relaxed) {
                return;
            }
            if let Some(w) = writer.as_mut() {
                let _ = w.write_all(prompt.as_bytes());
                let _ = w.flush();
            }
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            if cancel_flag.load(Ordering::Relaxed) {
                return;
            }
            match parse_answer(&line) {
                Some(approved) => {
                    let _ = tx.blocking_send(approved);
                    return;
                }
                None => continue,
            }
        }
    });

    Some(TtyListener {
        verdicts: rx,
        cancelled,
    })
}

/// `y`/`yes` approve, `n`/`no` reject, anything else re-prompts.
fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_yes_and_no_variants() {
        assert_eq!(parse_answer("y\n"), Some(true));
        assert_eq!(parse_answer("YES\n"), Some(true));
        assert_eq!(parse_answer("n\n"), Some(false));
        assert_eq!(parse_answer("No\n"), Some(false));
    }

    #[test]
    fn other_lines_reprompt() {
        assert_eq!(parse_answer("\n"), None);
        assert_eq!(parse_answer("maybe\n"), None);
        assert_eq!(parse_answer("approve\n"), None);
    }
}
