#![forbid(unsafe_code)]

//! `stay-concierge-ctl`: local operator CLI for `stay-concierge`.
//!
//! Connects to the IPC socket and sends JSON commands to the server.
//! The shared secret is read from `CONCIERGE_IPC_TOKEN` unless `--token`
//! is given.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand, ValueEnum};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "stay-concierge-ctl",
    about = "Local operator CLI for stay-concierge",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "stay-concierge")]
    ipc_name: String,

    /// Shared secret; defaults to `CONCIERGE_IPC_TOKEN`.
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Task status as accepted by the server.
#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Status {
    WaitingOnGuest,
    WaitingOnStaff,
    WaitingOnHost,
    Scheduled,
    InProgress,
    Escalated,
    Completed,
    Cancelled,
}

/// Action holder as accepted by the server.
#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Holder {
    Guest,
    Staff,
    Host,
}

fn wire_name<T: ValueEnum>(value: T) -> Option<String> {
    value
        .to_possible_value()
        .map(|v| v.get_name().replace('-', "_"))
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List tasks.
    List {
        /// Only tasks in this status.
        #[arg(long, value_enum)]
        status: Option<Status>,
        /// Only tasks at this property.
        #[arg(long)]
        property: Option<String>,
        /// Only tasks held by this party.
        #[arg(long, value_enum)]
        holder: Option<Holder>,
        /// Only open tasks without staff.
        #[arg(long)]
        unassigned: bool,
        /// Maximum rows.
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show one task.
    Get {
        /// Task ID.
        id: String,
    },

    /// Show a task's audit trail.
    Audit {
        /// Task ID.
        id: String,
    },

    /// Assign staff and route the task.
    Assign {
        /// Task ID.
        id: String,
        /// Staff contact address.
        staff_address: String,
        /// Staff identity.
        #[arg(long)]
        staff_id: Option<String>,
    },

    /// Edit a task.
    Patch {
        /// Task ID.
        id: String,
        /// New status.
        #[arg(long, value_enum)]
        status: Option<Status>,
        /// New action holder.
        #[arg(long, value_enum)]
        holder: Option<Holder>,
        /// Replacement staff requirements.
        #[arg(long)]
        staff_requirements: Option<String>,
        /// Replacement guest requirements.
        #[arg(long)]
        guest_requirements: Option<String>,
        /// Replacement host escalation criteria.
        #[arg(long)]
        host_escalation_criteria: Option<String>,
        /// Replacement escalation reason.
        #[arg(long)]
        escalation_reason: Option<String>,
    },

    /// Mark a task completed.
    Complete {
        /// Task ID.
        id: String,
    },

    /// Cancel a task.
    Cancel {
        /// Task ID.
        id: String,
        /// Optional reason.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Retry guest notices that ran out of attempts.
    Renotify {
        /// Task ID.
        id: String,
    },
}

fn build_request(command: &Command) -> serde_json::Value {
    match command {
        Command::List {
            status,
            property,
            holder,
            unassigned,
            limit,
        } => serde_json::json!({
            "command": "list",
            "status": status.and_then(wire_name),
            "property_id": property,
            "action_holder": holder.and_then(wire_name),
            "unassigned": unassigned,
            "limit": limit,
        }),
        Command::Get { id } => serde_json::json!({ "command": "get", "id": id }),
        Command::Audit { id } => serde_json::json!({ "command": "audit", "id": id }),
        Command::Assign {
            id,
            staff_address,
            staff_id,
        } => serde_json::json!({
            "command": "assign",
            "id": id,
            "staff_address": staff_address,
            "staff_id": staff_id,
        }),
        Command::Patch {
            id,
            status,
            holder,
            staff_requirements,
            guest_requirements,
            host_escalation_criteria,
            escalation_reason,
        } => serde_json::json!({
            "command": "patch",
            "id": id,
            "patch": {
                "status": status.and_then(wire_name),
                "action_holder": holder.and_then(wire_name),
                "staff_requirements": staff_requirements,
                "guest_requirements": guest_requirements,
                "host_escalation_criteria": host_escalation_criteria,
                "escalation_reason": escalation_reason,
            },
        }),
        Command::Complete { id } => serde_json::json!({ "command": "complete", "id": id }),
        Command::Cancel { id, reason } => {
            serde_json::json!({ "command": "cancel", "id": id, "reason": reason })
        }
        Command::Renotify { id } => serde_json::json!({ "command": "renotify", "id": id }),
    }
}

fn main() {
    let args = Cli::parse();

    let mut request_json = build_request(&args.command);
    let token = args
        .token
        .clone()
        .or_else(|| std::env::var("CONCIERGE_IPC_TOKEN").ok());
    if let Some(token) = token {
        request_json["auth_token"] = serde_json::Value::String(token);
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is stay-concierge running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
