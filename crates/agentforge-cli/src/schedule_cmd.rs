//! Schedule commands.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};

use clap::Subcommand;

use agentforge_core::model::{NewSchedule, RunSettings, Schedule, ScheduleUpdate, Weekdays};

use crate::client::DaemonClient;
use crate::fmt::timestamp;

/// Schedule subcommand actions.
#[derive(Subcommand, Debug)]
pub enum ScheduleAction {
    /// List schedules
    List,
    /// Add a recurring run window
    Add {
        /// Days: `daily`, `weekdays`, `weekends` or a list like `mon,wed,fri`
        days: Weekdays,
        /// UTC start time, HH:MM
        start: String,
        /// Window length in minutes (max 1440)
        duration: u32,
        /// Coding-agent concurrency for scheduled runs
        #[arg(long)]
        concurrency: Option<u8>,
        #[arg(long)]
        model: Option<String>,
        /// Skip regression testing agents
        #[arg(long)]
        yolo: bool,
        /// Create disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Delete a schedule
    Remove { id: i64 },
    /// Skip the current or next occurrence
    Skip { id: i64 },
    /// Show the next scheduled window
    Next,
    Enable { id: i64 },
    Disable { id: i64 },
    /// Suspend a schedule without disabling it
    Pause { id: i64 },
    Resume { id: i64 },
}

/// Execute a schedule subcommand.
pub async fn run(client: &DaemonClient, action: ScheduleAction) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match action {
        ScheduleAction::List => {
            let schedules = client.schedules().await?;
            write_table(&mut out, &schedules)?;
        }
        ScheduleAction::Add {
            days,
            start,
            duration,
            concurrency,
            model,
            yolo,
            disabled,
        } => {
            let new = NewSchedule {
                weekdays: days,
                start_time: start,
                duration_minutes: duration,
                enabled: !disabled,
                overrides: RunSettings {
                    max_concurrency: concurrency,
                    model,
                    yolo,
                },
            };
            let schedule = client.add_schedule(&new).await?;
            writeln!(
                out,
                "Created schedule #{}: {} at {} UTC for {} min",
                schedule.id, schedule.weekdays, schedule.start_time, schedule.duration_minutes
            )?;
        }
        ScheduleAction::Remove { id } => {
            client.remove_schedule(id).await?;
            writeln!(out, "Schedule #{id} removed.")?;
        }
        ScheduleAction::Skip { id } => {
            let schedule = client.skip_schedule(id).await?;
            match schedule.skip_until {
                Some(until) => writeln!(
                    out,
                    "Schedule #{id} will skip the window ending {}.",
                    timestamp(until)
                )?,
                None => writeln!(out, "Schedule #{id} will skip its next window.")?,
            }
        }
        ScheduleAction::Next => {
            let next = client.next_run().await?;
            if !next.has_schedules {
                writeln!(out, "No active schedules.")?;
            } else if next.is_currently_running {
                let end = next
                    .next_end
                    .map_or_else(|| "-".to_string(), |t| timestamp(t.timestamp()));
                writeln!(out, "A scheduled window is open until {end}.")?;
            } else if let Some(start) = next.next_start {
                writeln!(
                    out,
                    "Next window starts {} ({} active schedule(s)).",
                    timestamp(start.timestamp()),
                    next.active_schedule_count
                )?;
            } else {
                writeln!(out, "No upcoming window.")?;
            }
        }
        ScheduleAction::Enable { id } => update(client, &mut out, id, Some(true), None).await?,
        ScheduleAction::Disable { id } => update(client, &mut out, id, Some(false), None).await?,
        ScheduleAction::Pause { id } => update(client, &mut out, id, None, Some(true)).await?,
        ScheduleAction::Resume { id } => update(client, &mut out, id, None, Some(false)).await?,
    }
    Ok(())
}

async fn update(
    client: &DaemonClient,
    out: &mut impl Write,
    id: i64,
    enabled: Option<bool>,
    paused: Option<bool>,
) -> anyhow::Result<()> {
    let update = ScheduleUpdate {
        enabled,
        paused,
        ..ScheduleUpdate::default()
    };
    let schedule = client.update_schedule(id, &update).await?;
    writeln!(out, "Schedule #{} is {}.", schedule.id, state_label(&schedule))?;
    Ok(())
}

fn state_label(s: &Schedule) -> &'static str {
    if !s.enabled {
        "disabled"
    } else if s.paused {
        "paused"
    } else if s.skip_next {
        "skipping next"
    } else {
        "active"
    }
}

fn write_table(w: &mut impl Write, schedules: &[Schedule]) -> io::Result<()> {
    if schedules.is_empty() {
        return writeln!(w, "No schedules.");
    }
    writeln!(
        w,
        "{:<5}  {:<28}  {:<5}  {:<6}  {:<13}  LAST FAILED",
        "ID", "DAYS", "START", "MIN", "STATE"
    )?;
    for s in schedules {
        writeln!(
            w,
            "{:<5}  {:<28}  {:<5}  {:<6}  {:<13}  {}",
            s.id,
            s.weekdays.to_string(),
            s.start_time,
            s.duration_minutes,
            state_label(s),
            s.failed_window_start.map_or_else(|| "-".to_string(), timestamp),
        )?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn schedule() -> Schedule {
        Schedule {
            id: 2,
            weekdays: Weekdays::WORKDAYS,
            start_time: "22:00".into(),
            duration_minutes: 240,
            enabled: true,
            paused: false,
            skip_next: false,
            skip_until: None,
            overrides: RunSettings::default(),
            failed_window_start: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn state_label_precedence() {
        let mut s = schedule();
        assert_eq!(state_label(&s), "active");
        s.skip_next = true;
        assert_eq!(state_label(&s), "skipping next");
        s.paused = true;
        assert_eq!(state_label(&s), "paused");
        s.enabled = false;
        assert_eq!(state_label(&s), "disabled");
    }

    #[test]
    fn table_lists_days() {
        let mut buf = Vec::new();
        write_table(&mut buf, &[schedule()]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Mon,Tue,Wed,Thu,Fri"));
        assert!(text.contains("22:00"));
    }
}
