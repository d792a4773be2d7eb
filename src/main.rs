mod config_archive;
mod credential_vault;
mod engine;
mod error;
mod event_log;
mod fsutil;
mod login;
mod models;
mod notifier;
mod oauth;
mod process;
mod registry_store;
mod secret_store;
mod settings;
mod usage_fetcher;
mod usage_text;

use chrono::{DateTime, Local, Utc};
use engine::{AccountManager, EngineEvent, PublishedState};
use error::{SwitchError, SwitchResult};
use models::{Profile, RateLimitSnapshot};
use notifier::{LimitEventKind, ScheduleInstruction};
use settings::{default_home_dir, Settings};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CSWITCH_LOG";
const DEFAULT_LOG_FILTER: &str = "cswitch=info,warn";

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Help,
    List,
    Switch(String),
    Add(String),
    Remove(String),
    Rename { target: String, name: String },
    Refresh,
    Usage { json: bool },
}

impl CliCommand {
    fn parse(args: &[String]) -> SwitchResult<Self> {
        let Some(first) = args.first() else {
            return Ok(Self::List);
        };
        let usage = |text: &str| SwitchError::Usage(format!("usage: cswitch {}", text));

        match first.as_str() {
            "-h" | "--help" | "help" => Ok(Self::Help),
            "list" | "ls" => {
                if args.len() != 1 {
                    return Err(usage("list"));
                }
                Ok(Self::List)
            }
            "switch" | "use" => {
                if args.len() != 2 {
                    return Err(usage("switch <name|id>"));
                }
                Ok(Self::Switch(args[1].clone()))
            }
            "add" => {
                if args.len() != 2 {
                    return Err(usage("add <name>"));
                }
                Ok(Self::Add(args[1].clone()))
            }
            "remove" | "rm" => {
                if args.len() != 2 {
                    return Err(usage("remove <name|id>"));
                }
                Ok(Self::Remove(args[1].clone()))
            }
            "rename" => {
                if args.len() != 3 {
                    return Err(usage("rename <name|id> <new-name>"));
                }
                Ok(Self::Rename {
                    target: args[1].clone(),
                    name: args[2].clone(),
                })
            }
            "refresh" => {
                if args.len() != 1 {
                    return Err(usage("refresh"));
                }
                Ok(Self::Refresh)
            }
            "usage" => match &args[1..] {
                [] => Ok(Self::Usage { json: false }),
                [flag] if flag == "--json" => Ok(Self::Usage { json: true }),
                _ => Err(usage("usage [--json]")),
            },
            _ => Err(SwitchError::Usage(format!("unknown command: {}", first))),
        }
    }
}

fn print_usage() {
    println!(
        "cswitch - switch between Claude CLI accounts\n\n\
         Usage:\n\
           cswitch list                        List accounts and cached usage\n\
           cswitch switch <name|id>            Make an account the live one\n\
           cswitch add <name>                  Log in a new account via `claude /login`\n\
           cswitch remove <name|id>            Delete an inactive account and its backups\n\
           cswitch rename <name|id> <new>      Rename an account\n\
           cswitch refresh                     Refresh usage for the active account\n\
           cswitch usage [--json]              Print the published state\n\
           cswitch help                        Show this help\n\n\
         Environment:\n\
           CSWITCH_HOME            data directory (registry, backups, logs)\n\
           CSWITCH_LOG             log filter, default \"{}\"\n\
           CSWITCH_CLAUDE_BIN      path to the claude binary\n\
           CLAUDE_CODE_USAGE_URL   usage API endpoint",
        DEFAULT_LOG_FILTER
    );
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("cswitch: {}", err);
        std::process::exit(err.exit_code());
    }
}

fn run() -> SwitchResult<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = CliCommand::parse(&args)?;
    if command == CliCommand::Help {
        print_usage();
        return Ok(());
    }

    let settings = Settings::from_env(default_home_dir());
    tracing::debug!("data directory: {}", settings.app_dir.display());
    let mut manager = AccountManager::open(settings)?;
    if manager.bootstrap()?.is_some() {
        if let Some(profile) = manager.state().active() {
            println!("Adopted current login as {}", profile.display_label());
        }
    }

    let result = match command {
        CliCommand::Help => Ok(()),
        CliCommand::List => {
            print_lines(&inventory_lines(&manager.state(), Utc::now()));
            Ok(())
        }
        CliCommand::Switch(target) => {
            if manager.switch_to(&target)? {
                if let Some(profile) = manager.state().active() {
                    println!("Switched to {}", profile.display_label());
                }
            } else {
                println!("{} is already active", target);
            }
            Ok(())
        }
        CliCommand::Add(name) => {
            println!("Starting `claude /login` for {}; finish the login in your browser.", name);
            let profile = manager.add_account(&name)?;
            println!("Added {}", profile.display_label());
            Ok(())
        }
        CliCommand::Remove(target) => {
            let profile = manager.remove_account(&target)?;
            println!("Removed {}", profile.display_label());
            Ok(())
        }
        CliCommand::Rename { target, name } => {
            let profile = manager.rename_account(&target, &name)?;
            println!("Renamed to {}", profile.name);
            Ok(())
        }
        CliCommand::Refresh => {
            let refreshed = manager.refresh_usage();
            print_lines(&inventory_lines(&manager.state(), Utc::now()));
            refreshed
        }
        CliCommand::Usage { json } => {
            let state = manager.state();
            if json {
                let text = serde_json::to_string_pretty(&state).map_err(|err| {
                    SwitchError::ParseError(format!("failed to encode state: {}", err))
                })?;
                println!("{}", text);
            } else {
                print_lines(&inventory_lines(&state, Utc::now()));
            }
            Ok(())
        }
    };

    print_lines(&event_lines(&manager.drain_events()));
    result
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}

fn inventory_lines(state: &PublishedState, now: DateTime<Utc>) -> Vec<String> {
    if state.profiles.is_empty() {
        return vec!["No accounts yet. Log in with `cswitch add <name>`.".to_string()];
    }

    let mut lines = Vec::new();
    for profile in &state.profiles {
        lines.push(profile_line(profile, now));
    }
    if let Some(refreshed) = state.last_refreshed {
        lines.push(format!("Last refreshed {}", format_local(refreshed)));
    }
    lines
}

fn profile_line(profile: &Profile, now: DateTime<Utc>) -> String {
    let marker = if profile.is_active { "*" } else { " " };
    let mut line = format!("{} {}", marker, profile.display_label());
    if !profile.authenticated {
        line.push_str(" [login pending]");
    }
    if let Some(limits) = profile.rate_limit.as_ref() {
        if let Some(plan) = limits.subscription_type.as_deref() {
            line.push_str(&format!(" [{}]", plan));
        }
        line.push_str(&format!("  {}", limit_summary(limits, now)));
    }
    if let Some(usage) = profile.usage.as_ref() {
        line.push_str(&format!(
            "  messages today {} / week {}",
            usage.today_messages, usage.week_messages
        ));
    }
    line
}

fn limit_summary(limits: &RateLimitSnapshot, now: DateTime<Utc>) -> String {
    let window = |label: &str, ratio: f64, reset: Option<DateTime<Utc>>| {
        let percent = (ratio * 100.0).round();
        match reset.filter(|at| *at > now) {
            Some(at) => format!("{} {:.0}% (resets {})", label, percent, format_local(at)),
            None => format!("{} {:.0}%", label, percent),
        }
    };
    format!(
        "{}  {}",
        window("session", limits.session_usage_ratio(now), limits.session_reset),
        window("weekly", limits.weekly_usage_ratio(now), limits.weekly_reset)
    )
}

fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

fn event_lines(events: &[EngineEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Limit(limit) => Some(match limit.kind {
                LimitEventKind::Hit => format!("{} limit reached", limit.window.as_str()),
                LimitEventKind::Reset => format!("{} limit has reset", limit.window.as_str()),
            }),
            EngineEvent::Schedule(ScheduleInstruction::Schedule { window, fire_at, .. }) => {
                Some(format!(
                    "{} limit resets at {}",
                    window.as_str(),
                    format_local(*fire_at)
                ))
            }
            EngineEvent::LoginUrl { url } => Some(format!("Login URL: {}", url)),
            EngineEvent::Schedule(ScheduleInstruction::Cancel { .. })
            | EngineEvent::RegistryChanged => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UsageSource;
    use crate::notifier::{LimitEvent, LimitWindow};
    use chrono::{Duration, TimeZone};

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parse_defaults_to_list() {
        assert_eq!(CliCommand::parse(&[]).expect("parse"), CliCommand::List);
        assert_eq!(
            CliCommand::parse(&args(&["switch", "work"])).expect("parse"),
            CliCommand::Switch("work".to_string())
        );
        assert_eq!(
            CliCommand::parse(&args(&["rename", "work", "Work Max"])).expect("parse"),
            CliCommand::Rename {
                target: "work".to_string(),
                name: "Work Max".to_string()
            }
        );
        assert_eq!(
            CliCommand::parse(&args(&["usage", "--json"])).expect("parse"),
            CliCommand::Usage { json: true }
        );
    }

    #[test]
    fn parse_rejects_bad_arity_with_usage_exit_code() {
        let err = CliCommand::parse(&args(&["switch"])).expect_err("missing target");
        assert_eq!(err.exit_code(), 2);
        let err = CliCommand::parse(&args(&["frobnicate"])).expect_err("unknown");
        assert!(err.to_string().contains("unknown command"));
        assert!(CliCommand::parse(&args(&["usage", "--yaml"])).is_err());
    }

    #[test]
    fn profile_line_marks_active_and_applies_reset_rule() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 18, 0, 0).unwrap();
        let mut profile = Profile::new("work");
        profile.is_active = true;
        profile.username = Some("me@example.com".to_string());
        let mut limits = RateLimitSnapshot::percent_scale(UsageSource::Api, now);
        limits.session_used = 95.0;
        limits.session_reset = Some(now - Duration::minutes(1));
        limits.weekly_used = 40.0;
        limits.subscription_type = Some("max".to_string());
        profile.rate_limit = Some(limits);

        let line = profile_line(&profile, now);
        assert!(line.starts_with("* work (me@example.com) [max]"));
        assert!(line.contains("session 0%"));
        assert!(line.contains("weekly 40%"));
    }

    #[test]
    fn event_lines_skip_bookkeeping_events() {
        let lines = event_lines(&[
            EngineEvent::RegistryChanged,
            EngineEvent::Limit(LimitEvent {
                profile_id: "p".to_string(),
                window: LimitWindow::Weekly,
                kind: LimitEventKind::Hit,
                reset_at: None,
            }),
            EngineEvent::Schedule(ScheduleInstruction::Cancel {
                id: "p-weekly-reset".to_string(),
            }),
        ]);
        assert_eq!(lines, vec!["weekly limit reached".to_string()]);
    }
}
