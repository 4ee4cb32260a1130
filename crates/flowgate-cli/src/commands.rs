//! Command execution: each subcommand maps onto one IPC request type.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::args::{Cli, Command, DemoBlockCmd, HistoryCmd, LkgCmd, WatchCmd};
use crate::client::IpcClient;

const OK: i32 = 0;
const FAILED: i32 = 1;

pub async fn dispatch(cli: Cli) -> Result<i32> {
    let client = IpcClient::new(cli.socket_path());
    match cli.cmd {
        Command::Status => status(&client).await,
        Command::Bootstrap => bootstrap(&client).await,
        Command::Teardown => {
            client.expect_ok("teardown", Value::Null).await?;
            println!("provider and sublayer removed");
            Ok(OK)
        }
        Command::Validate { file } => validate(&client, &file).await,
        Command::Apply { file } => apply(&client, &file).await,
        Command::Rollback => {
            let response = client.expect_ok("rollback", Value::Null).await?;
            println!(
                "removed {} filter(s)",
                response["filtersRemoved"].as_u64().unwrap_or(0)
            );
            Ok(OK)
        }
        Command::Lkg { cmd } => lkg(&client, cmd).await,
        Command::Watch { cmd } => watch(&client, cmd).await,
        Command::Logs(args) => logs(&client, args.tail, args.since).await,
        Command::DemoBlock { cmd } => demo_block(&client, cmd).await,
        Command::Simulate(args) => simulate(&client, args).await,
        Command::BlockRules => block_rules(&client).await,
        Command::History { cmd } => history(&client, cmd).await,
    }
}

async fn status(client: &IpcClient) -> Result<i32> {
    let response = client.expect_ok("ping", Value::Null).await?;
    println!(
        "flowgated {} up {}s (server time {})",
        response["version"].as_str().unwrap_or("?"),
        response["uptimeSecs"].as_u64().unwrap_or(0),
        response["time"].as_str().unwrap_or("?"),
    );
    Ok(OK)
}

async fn bootstrap(client: &IpcClient) -> Result<i32> {
    let response = client.expect_ok("bootstrap", Value::Null).await?;
    println!(
        "provider: {}  sublayer: {}",
        presence(&response["providerExists"]),
        presence(&response["sublayerExists"]),
    );
    Ok(OK)
}

fn presence(value: &Value) -> &'static str {
    if value.as_bool().unwrap_or(false) {
        "present"
    } else {
        "absent"
    }
}

/// The service reads the file itself, so the path must be absolute from its
/// point of view.
fn absolute(file: &Path) -> Result<String> {
    let path = if file.is_absolute() {
        file.to_path_buf()
    } else {
        std::fs::canonicalize(file)
            .with_context(|| format!("cannot resolve '{}'", file.display()))?
    };
    Ok(path.display().to_string())
}

async fn validate(client: &IpcClient, file: &Path) -> Result<i32> {
    let response = client
        .expect_ok("validate", json!({ "policyPath": absolute(file)? }))
        .await?;
    if response["valid"].as_bool() == Some(true) {
        println!(
            "policy OK: version {} with {} rule(s)",
            response["policyVersion"].as_str().unwrap_or("?"),
            response["ruleCount"].as_u64().unwrap_or(0),
        );
        return Ok(OK);
    }
    let issues = response["issues"].as_array().cloned().unwrap_or_default();
    eprintln!("policy has {} issue(s):", issues.len());
    for issue in issues {
        eprintln!(
            "  {}: {}",
            issue["path"].as_str().unwrap_or("?"),
            issue["message"].as_str().unwrap_or("?"),
        );
    }
    Ok(FAILED)
}

async fn apply(client: &IpcClient, file: &Path) -> Result<i32> {
    let response = client
        .expect_ok("apply", json!({ "policyPath": absolute(file)? }))
        .await?;
    println!(
        "applied policy {}: {} created, {} removed, {} unchanged, {} skipped",
        response["policyVersion"].as_str().unwrap_or("?"),
        response["filtersCreated"].as_u64().unwrap_or(0),
        response["filtersRemoved"].as_u64().unwrap_or(0),
        response["unchanged"].as_u64().unwrap_or(0),
        response["rulesSkipped"].as_u64().unwrap_or(0),
    );
    for warning in response["warnings"].as_array().cloned().unwrap_or_default() {
        eprintln!("warning: {}", warning.as_str().unwrap_or("?"));
    }
    Ok(OK)
}

async fn lkg(client: &IpcClient, cmd: LkgCmd) -> Result<i32> {
    match cmd {
        LkgCmd::Show => {
            let response = client.expect_ok("lkg-show", Value::Null).await?;
            if response["exists"].as_bool() != Some(true) {
                println!("no last-known-good policy");
                return Ok(OK);
            }
            println!(
                "saved {} from '{}' ({} bytes, sha256 {})",
                response["savedAt"].as_str().unwrap_or("?"),
                response["sourcePath"].as_str().unwrap_or("?"),
                response["policyBytes"].as_u64().unwrap_or(0),
                response["checksum"].as_str().unwrap_or("?"),
            );
            Ok(OK)
        }
        LkgCmd::Revert => {
            let response = client.expect_ok("lkg-revert", Value::Null).await?;
            println!(
                "reverted to last-known-good policy {}: {} created, {} removed",
                response["policyVersion"].as_str().unwrap_or("?"),
                response["filtersCreated"].as_u64().unwrap_or(0),
                response["filtersRemoved"].as_u64().unwrap_or(0),
            );
            Ok(OK)
        }
    }
}

async fn watch(client: &IpcClient, cmd: WatchCmd) -> Result<i32> {
    let response = match cmd {
        WatchCmd::Set { file: Some(file) } => {
            client
                .expect_ok("watch-set", json!({ "policyPath": absolute(&file)? }))
                .await?
        }
        WatchCmd::Set { file: None } => client.expect_ok("watch-set", Value::Null).await?,
        WatchCmd::Status => client.expect_ok("watch-status", Value::Null).await?,
    };
    match response["watching"].as_str() {
        Some(path) => println!(
            "watching '{}' (debounce {}ms): {} applied, {} error(s)",
            path,
            response["debounceMs"].as_u64().unwrap_or(0),
            response["applyCount"].as_u64().unwrap_or(0),
            response["errorCount"].as_u64().unwrap_or(0),
        ),
        None => println!("not watching"),
    }
    if let Some(err) = response["lastError"].as_str() {
        println!("last error: {err}");
    }
    Ok(OK)
}

async fn logs(client: &IpcClient, tail: Option<usize>, since: Option<i64>) -> Result<i32> {
    let mut fields = serde_json::Map::new();
    if let Some(tail) = tail {
        fields.insert("tail".into(), Value::from(tail));
    }
    if let Some(since) = since {
        fields.insert("sinceMinutes".into(), Value::from(since));
    }
    let response = client.expect_ok("audit-logs", Value::Object(fields)).await?;
    for entry in response["entries"].as_array().cloned().unwrap_or_default() {
        let status = entry["status"].as_str().unwrap_or("-");
        let mut line = format!(
            "{}  {:<24} {:<10} {}",
            entry["ts"].as_str().unwrap_or("?"),
            entry["event"].as_str().unwrap_or("?"),
            entry["source"].as_str().unwrap_or("?"),
            status,
        );
        if let Some(message) = entry["errorMessage"].as_str() {
            line.push_str(&format!("  {message}"));
        }
        println!("{line}");
    }
    Ok(OK)
}

async fn demo_block(client: &IpcClient, cmd: DemoBlockCmd) -> Result<i32> {
    match cmd {
        DemoBlockCmd::Enable => {
            let response = client.expect_ok("demo-block-enable", Value::Null).await?;
            if response["created"].as_bool() == Some(true) {
                println!("demo block filter installed");
            } else {
                println!("demo block filter was already installed");
            }
        }
        DemoBlockCmd::Disable => {
            let response = client.expect_ok("demo-block-disable", Value::Null).await?;
            if response["removed"].as_bool() == Some(true) {
                println!("demo block filter removed");
            } else {
                println!("demo block filter was not installed");
            }
        }
        DemoBlockCmd::Status => {
            let response = client.expect_ok("demo-block-status", Value::Null).await?;
            println!(
                "demo block filter is {}",
                if response["enabled"].as_bool() == Some(true) {
                    "enabled"
                } else {
                    "disabled"
                }
            );
        }
    }
    Ok(OK)
}

async fn simulate(client: &IpcClient, args: crate::args::SimulateArgs) -> Result<i32> {
    let response = client
        .expect_ok(
            "simulate",
            json!({
                "direction": args.direction,
                "protocol": args.protocol,
                "remoteIp": args.remote_ip,
                "remotePort": args.remote_port,
                "localIp": args.local_ip,
                "localPort": args.local_port,
                "processPath": args.process,
            }),
        )
        .await?;
    let verdict = if response["wouldAllow"].as_bool() == Some(true) {
        "ALLOW"
    } else {
        "BLOCK"
    };
    match response["matchedRuleId"].as_str() {
        Some(rule) => println!("{verdict} (rule '{rule}')"),
        None => println!("{verdict} (default action)"),
    }
    for line in response["trace"].as_array().cloned().unwrap_or_default() {
        println!("  {}", line.as_str().unwrap_or("?"));
    }
    Ok(OK)
}

async fn block_rules(client: &IpcClient) -> Result<i32> {
    let response = client.expect_ok("block-rules", Value::Null).await?;
    if response["loaded"].as_bool() != Some(true) {
        println!("no policy loaded");
        return Ok(OK);
    }
    for rule in response["rules"].as_array().cloned().unwrap_or_default() {
        println!(
            "{:<32} priority {:>6}  {}",
            rule["id"].as_str().unwrap_or("?"),
            rule["priority"].as_i64().unwrap_or(0),
            rule["summary"].as_str().unwrap_or("?"),
        );
    }
    Ok(OK)
}

async fn history(client: &IpcClient, cmd: HistoryCmd) -> Result<i32> {
    match cmd {
        HistoryCmd::List => {
            let response = client.expect_ok("policy-history", Value::Null).await?;
            for entry in response["entries"].as_array().cloned().unwrap_or_default() {
                println!(
                    "{}  v{:<10} {:>5} rule(s)  +{} -{}  {}",
                    entry["id"].as_str().unwrap_or("?"),
                    entry["policyVersion"].as_str().unwrap_or("?"),
                    entry["ruleCount"].as_u64().unwrap_or(0),
                    entry["filtersCreated"].as_u64().unwrap_or(0),
                    entry["filtersRemoved"].as_u64().unwrap_or(0),
                    entry["source"].as_str().unwrap_or("?"),
                );
            }
        }
        HistoryCmd::Show { id } => {
            let response = client
                .expect_ok("policy-history-get", json!({ "id": id }))
                .await?;
            println!("{}", response["policyJson"].as_str().unwrap_or("{}"));
        }
        HistoryCmd::Revert { id } => {
            let response = client
                .expect_ok("policy-history-revert", json!({ "id": id }))
                .await?;
            println!(
                "reverted to '{}': {} created, {} removed",
                id,
                response["filtersCreated"].as_u64().unwrap_or(0),
                response["filtersRemoved"].as_u64().unwrap_or(0),
            );
        }
    }
    Ok(OK)
}
