//! Welcome banner, recent-logins table, and the animated boot progress bar.

use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use russh::{ChannelId, CryptoVec};
use tabled::{Table, Tabled};
use tokio::sync::oneshot;

use sshvm_core::UserStat;

use crate::server::ServerHandle;

/// Width of the progress bar.
pub const PROGRESS_CELLS: usize = 40;

const TICK: Duration = Duration::from_millis(50);

/// Write a chunk to the session, reporting only whether the client is still
/// there.
pub(crate) async fn send(
    handle: &ServerHandle,
    id: ChannelId,
    text: impl Into<Vec<u8>>,
) -> Result<(), ()> {
    handle
        .data(id, CryptoVec::from(text.into()))
        .await
        .map_err(|_| ())
}

// ── Welcome banner ────────────────────────────────────────────────────────────

#[derive(Tabled)]
struct RecentRow {
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "Last login")]
    last_login: String,
}

pub fn welcome_banner(
    user: &str,
    previous_login: Option<DateTime<Utc>>,
    recent: &[UserStat],
    fresh_vm: bool,
) -> String {
    let mut out = String::new();
    let day = Local::now().format("%A");

    out.push_str(&format!("\r\n\x1b[1;35mHello, {user}! 🌸\x1b[0m\r\n\r\n"));
    match previous_login {
        None => out.push_str(&format!(
            "Today is \x1b[3m{day}\x1b[0m. It's your first time here.\r\n"
        )),
        Some(t) => out.push_str(&format!(
            "Today is \x1b[3m{day}\x1b[0m. Your last login was \x1b[3m{}\x1b[0m.\r\n",
            relative_time(t)
        )),
    }
    out.push_str("\r\n");

    if recent.is_empty() {
        out.push_str("You're the first user to connect! 🎉\r\n");
    } else {
        out.push_str("\x1b[2;37mRecent logins:\x1b[0m\r\n");
        let rows: Vec<RecentRow> = recent
            .iter()
            .map(|stat| RecentRow {
                user: stat.username.clone(),
                last_login: relative_time(stat.last_connected),
            })
            .collect();
        out.push_str(&Table::new(rows).to_string().replace('\n', "\r\n"));
        out.push_str("\r\n");
    }

    out.push_str("\r\n");
    if fresh_vm {
        out.push_str("\x1b[2;37mBooting your fresh VM...\x1b[0m\r\n");
    } else {
        out.push_str("\x1b[2;37mConnecting to VM...\x1b[0m\r\n");
    }
    out
}

pub fn relative_time(t: DateTime<Utc>) -> String {
    let diff = Utc::now().signed_duration_since(t);
    if diff.num_minutes() < 1 {
        return "just now".to_string();
    }
    if diff.num_hours() < 1 {
        let minutes = diff.num_minutes();
        return match minutes {
            1 => "1 minute ago".to_string(),
            n => format!("{n} minutes ago"),
        };
    }
    if diff.num_days() < 1 {
        let hours = diff.num_hours();
        return match hours {
            1 => "1 hour ago".to_string(),
            n => format!("{n} hours ago"),
        };
    }
    match diff.num_days() {
        1 => "1 day ago".to_string(),
        n => format!("{n} days ago"),
    }
}

// ── Progress bar ──────────────────────────────────────────────────────────────

/// Exponential fill: fast at first, asymptotic to 99 until readiness jumps
/// it to 100.
pub fn progress_percent(elapsed_secs: f64) -> usize {
    let percent = (100.0 * (1.0 - (-1.2 * elapsed_secs).exp())) as usize;
    percent.min(99)
}

pub fn filled_cells(percent: usize) -> usize {
    (percent * PROGRESS_CELLS) / 100
}

fn bar(filled: usize) -> String {
    let mut s = "▮".repeat(filled);
    s.push_str(&"▯".repeat(PROGRESS_CELLS - filled));
    s
}

/// Animate the bar on a single row until one of the signals arrives:
/// `ready` completes the bar at 100%, `failed` clears the row. A write
/// failure means the client disconnected, which also ends the animation.
pub async fn render_progress(
    handle: ServerHandle,
    id: ChannelId,
    mut ready: oneshot::Receiver<()>,
    mut failed: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(TICK);
    let start = std::time::Instant::now();

    loop {
        tokio::select! {
            _ = &mut ready => {
                let line = format!(
                    "\r\x1b[2K\x1b[32m{}\x1b[0m 100%  🧨 \x1b[32mComplete!\x1b[0m\r\n\r\n",
                    bar(PROGRESS_CELLS)
                );
                let _ = send(&handle, id, line).await;
                return;
            }
            _ = &mut failed => {
                let _ = send(&handle, id, "\r\x1b[2K").await;
                return;
            }
            _ = ticker.tick() => {
                let percent = progress_percent(start.elapsed().as_secs_f64());
                let line = format!("\r\x1b[36m{}\x1b[0m {percent}%", bar(filled_cells(percent)));
                if send(&handle, id, line).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stat(name: &str, ts: i64) -> UserStat {
        UserStat {
            username: name.to_string(),
            connect_count: 1,
            last_connected: Utc.timestamp_opt(ts, 0).unwrap(),
        }
    }

    #[test]
    fn test_relative_time_buckets() {
        let now = Utc::now();
        assert_eq!(relative_time(now), "just now");
        assert_eq!(relative_time(now - chrono::Duration::minutes(1)), "1 minute ago");
        assert_eq!(relative_time(now - chrono::Duration::minutes(5)), "5 minutes ago");
        assert_eq!(relative_time(now - chrono::Duration::hours(1)), "1 hour ago");
        assert_eq!(relative_time(now - chrono::Duration::hours(23)), "23 hours ago");
        assert_eq!(relative_time(now - chrono::Duration::days(1)), "1 day ago");
        assert_eq!(relative_time(now - chrono::Duration::days(10)), "10 days ago");
    }

    #[test]
    fn test_progress_percent_curve() {
        assert_eq!(progress_percent(0.0), 0);
        assert!(progress_percent(0.5) > 40);
        assert!(progress_percent(2.0) > 85);
        // Clamped at 99 no matter how long the boot takes.
        assert_eq!(progress_percent(60.0), 99);
    }

    #[test]
    fn test_filled_cells() {
        assert_eq!(filled_cells(0), 0);
        assert_eq!(filled_cells(50), 20);
        assert_eq!(filled_cells(99), 39);
        assert_eq!(filled_cells(100), PROGRESS_CELLS);
    }

    #[test]
    fn test_welcome_banner_first_time() {
        let banner = welcome_banner("alice", None, &[], true);
        assert!(banner.contains("Hello, alice!"));
        assert!(banner.contains("It's your first time here."));
        assert!(banner.contains("You're the first user to connect!"));
        assert!(banner.contains("Booting your fresh VM..."));
    }

    #[test]
    fn test_welcome_banner_returning_user() {
        let previous = Utc::now() - chrono::Duration::hours(2);
        let recent = vec![stat("bob", 1_700_000_000), stat("carol", 1_700_000_100)];
        let banner = welcome_banner("alice", Some(previous), &recent, false);
        assert!(banner.contains("Your last login was"));
        assert!(banner.contains("Recent logins:"));
        assert!(banner.contains("bob"));
        assert!(banner.contains("carol"));
        assert!(banner.contains("Connecting to VM..."));
    }
}
