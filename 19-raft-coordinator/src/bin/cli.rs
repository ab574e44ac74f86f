//! Command-line client: one-shot subcommands or an interactive shell.

use anyhow::Result;
use clap::Parser;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use raft_coordinator::cli::{ClientCli, ClientCommand};
use raft_coordinator::error::SdkError;
use raft_coordinator::init_tracing;
use raft_coordinator::protocol::{ConsoleCommand, HELP};
use raft_coordinator::sdk::{Client, WatchEventKind};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = ClientCli::parse();
    let client = Client::connect(cli.client_config());

    let command = match cli.command {
        None | Some(ClientCommand::Shell) => return run_shell(&client).await,
        Some(ClientCommand::Put(args)) => ConsoleCommand::Put {
            key: args.key,
            value: args.value,
        },
        Some(ClientCommand::Get(args)) => ConsoleCommand::Get { key: args.key },
        Some(ClientCommand::Delete(args)) => ConsoleCommand::Delete { key: args.key },
        Some(ClientCommand::Scan(args)) => ConsoleCommand::Scan {
            start: args.start,
            end: args.end,
        },
        Some(ClientCommand::Watch(args)) => ConsoleCommand::Watch { key: args.key },
        Some(ClientCommand::Show) => ConsoleCommand::Show,
        Some(ClientCommand::Stat) => ConsoleCommand::Stat,
        Some(ClientCommand::Clean(args)) => ConsoleCommand::Clean {
            end_index: args.end_index,
        },
    };
    for line in execute(&client, command).await {
        println!("{line}");
    }
    Ok(())
}

async fn run_shell(client: &Client) -> Result<()> {
    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();
    let mut input = String::new();
    println!("session {}; type help for commands", client.session_id());

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        input.clear();
        let read = tokio::select! {
            read = stdin.read_line(&mut input) => read?,
            _ = tokio::signal::ctrl_c() => break,
        };
        if read == 0 {
            break;
        }
        if input.trim().is_empty() {
            continue;
        }
        let command = match ConsoleCommand::parse(&input) {
            Ok(ConsoleCommand::Exit) => break,
            Ok(command) => command,
            Err(err) => {
                println!("error: {err}");
                continue;
            }
        };
        for line in execute(client, command).await {
            println!("{line}");
        }
    }
    Ok(())
}

/// Runs one command and renders its outcome as output lines.
async fn execute(client: &Client, command: ConsoleCommand) -> Vec<String> {
    let done = |result: Result<(), SdkError>| match result {
        Ok(()) => vec!["ok".to_string()],
        Err(err) => vec![format!("error: {err}")],
    };
    match command {
        ConsoleCommand::Put { key, value } => done(client.put(&key, &value).await),
        ConsoleCommand::Get { key } => match client.get(&key).await {
            Ok(value) => vec![value],
            Err(err) => vec![format!("error: {err}")],
        },
        ConsoleCommand::Delete { key } => done(client.delete(&key).await),
        ConsoleCommand::Scan { start, end } => match client.scan(&start, &end).collect().await {
            Ok(items) if items.is_empty() => vec!["(empty)".to_string()],
            Ok(items) => items
                .into_iter()
                .map(|(key, value)| format!("{key} => {value}"))
                .collect(),
            Err(err) => vec![format!("error: {err}")],
        },
        ConsoleCommand::Lock { key } => done(client.lock(&key).await),
        ConsoleCommand::TryLock { key } => done(client.try_lock(&key).await),
        ConsoleCommand::UnLock { key } => done(client.unlock(&key).await),
        ConsoleCommand::Watch { key } => {
            let event = client.watch(&key).wait().await;
            match event.kind {
                WatchEventKind::Changed => match event.value {
                    Some(value) => vec![format!("{key} changed: {value}")],
                    None => vec![format!("{key} deleted")],
                },
                WatchEventKind::ClusterDown => vec!["error: cluster is down".to_string()],
                WatchEventKind::Canceled => vec!["watch canceled".to_string()],
            }
        }
        ConsoleCommand::Show => {
            let nodes = client.show_cluster().await;
            if nodes.is_empty() {
                warn!("no member answered");
            }
            nodes
                .into_iter()
                .map(|node| {
                    format!(
                        "{} {} term={} last_log={}@{} commit={} applied={}",
                        node.server_id,
                        node.role,
                        node.term,
                        node.last_log_index,
                        node.last_log_term,
                        node.commit_index,
                        node.last_applied
                    )
                })
                .collect()
        }
        ConsoleCommand::Stat => match client.show_statistics().await {
            Ok(stats) => stats
                .into_iter()
                .map(|stat| {
                    format!(
                        "{:<10} current={} average={}",
                        stat.op.to_string(),
                        stat.current,
                        stat.average
                    )
                })
                .collect(),
            Err(err) => vec![format!("error: {err}")],
        },
        ConsoleCommand::Clean { end_index } => done(client.clean_binlog(end_index).await),
        ConsoleCommand::Help => vec![HELP.to_string()],
        ConsoleCommand::Exit => Vec::new(),
    }
}
