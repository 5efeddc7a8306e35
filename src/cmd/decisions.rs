//! `sdp decisions`: append to and browse the decision log.

use anyhow::Result;
use std::path::Path;

use super::super::DecisionCommands;
use super::print_json;

pub fn cmd_decisions(project_dir: &Path, verbose: bool, command: &DecisionCommands) -> Result<()> {
    use sdp::checkpoint::validate_feature_id;
    use sdp::config::{CliOverrides, Config};
    use sdp::errors::SdpError;
    use sdp::ledger::{Decision, DecisionLog, DecisionType, default_actor};

    let config = Config::new(project_dir, verbose, CliOverrides::default())?;
    let log = DecisionLog::new(config.decisions_file.clone());

    match command {
        DecisionCommands::Log {
            decision_type,
            question,
            decision,
            rationale,
            alternatives,
            maker,
            feature,
            ws,
        } => {
            let decision_type: DecisionType = decision_type.parse()?;
            if let Some(feature) = feature {
                validate_feature_id(feature).map_err(SdpError::from)?;
            }
            let mut entry = Decision::new(decision_type, question.as_str(), decision.as_str());
            entry.rationale = rationale.clone().unwrap_or_default();
            entry.alternatives = alternatives
                .iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect();
            entry.decision_maker = maker.clone().unwrap_or_else(default_actor);
            entry.feature_id = feature.clone().unwrap_or_default();
            entry.workstream_id = ws.clone().unwrap_or_default();

            let logged = log.log(entry)?;
            println!(
                "{} {} decision at {}",
                console::style("Logged").green().bold(),
                logged.decision_type,
                logged.timestamp.to_rfc3339()
            );
        }
        DecisionCommands::List {
            offset,
            limit,
            feature,
            search,
            json,
        } => {
            let entries = if search.is_none() && feature.is_none() {
                log.load(*offset, *limit)?
            } else {
                let mut all = match search {
                    Some(q) => log.search(q)?,
                    None => log.load_all()?,
                };
                if let Some(f) = feature {
                    all.retain(|d| &d.feature_id == f);
                }
                all.into_iter().skip(*offset).take(*limit).collect()
            };

            if *json {
                for d in &entries {
                    print_json(d)?;
                }
                return Ok(());
            }

            if entries.is_empty() {
                println!();
                println!("No decisions recorded in {}", log.path().display());
                println!();
                return Ok(());
            }

            println!();
            println!(
                "{:<20} {:<10} {:<8} {:<40} Decision",
                "When", "Type", "Feature", "Question"
            );
            println!(
                "{:<20} {:<10} {:<8} {:<40} --------",
                "--------------------", "----------", "--------", "----------------------------------------"
            );
            for d in &entries {
                println!(
                    "{:<20} {:<10} {:<8} {:<40} {}",
                    d.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    d.decision_type,
                    if d.feature_id.is_empty() { "-" } else { d.feature_id.as_str() },
                    truncate(&d.question, 40),
                    d.decision
                );
                if !d.rationale.is_empty() {
                    println!("{:<20} {}", "", console::style(&d.rationale).dim());
                }
            }
            println!();
        }
    }
    Ok(())
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
