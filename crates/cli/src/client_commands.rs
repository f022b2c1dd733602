//! Thin client commands against a running coordination server.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum WorkspaceAction {
    /// List workspaces.
    List,
    /// Show one workspace's status.
    Status { id: String },
    /// Stop a running workspace.
    Stop { id: String },
    /// Delete a workspace.
    Rm { id: String },
}

#[derive(Subcommand)]
pub enum NodeAction {
    /// List registered nodes.
    List,
}

async fn get_json(url: &str) -> anyhow::Result<serde_json::Value> {
    let resp = reqwest::get(url).await?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await?;
    if !status.is_success() {
        anyhow::bail!(
            "{status}: {}",
            body["message"].as_str().unwrap_or("request failed")
        );
    }
    Ok(body)
}

async fn send_json(method: reqwest::Method, url: &str) -> anyhow::Result<serde_json::Value> {
    let resp = reqwest::Client::new().request(method, url).send().await?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await?;
    if !status.is_success() {
        anyhow::bail!(
            "{status}: {}",
            body["message"].as_str().unwrap_or("request failed")
        );
    }
    Ok(body)
}

pub async fn run_workspace_action(server: &str, action: WorkspaceAction) -> anyhow::Result<()> {
    match action {
        WorkspaceAction::List => {
            let body = get_json(&format!("{server}/api/v1/workspaces")).await?;
            let Some(workspaces) = body["workspaces"].as_array() else {
                anyhow::bail!("malformed response");
            };
            if workspaces.is_empty() {
                println!("no workspaces");
                return Ok(());
            }
            for ws in workspaces {
                println!(
                    "{}  {}  {}  ssh:{}  [{}]",
                    ws["id"].as_str().unwrap_or("-"),
                    ws["name"].as_str().unwrap_or("-"),
                    ws["status"].as_str().unwrap_or("-"),
                    ws["sshPort"].as_u64().unwrap_or(0),
                    ws["provider"].as_str().unwrap_or("-"),
                );
            }
        },
        WorkspaceAction::Status { id } => {
            let body = get_json(&format!("{server}/api/v1/workspaces/{id}/status")).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        },
        WorkspaceAction::Stop { id } => {
            let body = send_json(
                reqwest::Method::POST,
                &format!("{server}/api/v1/workspaces/{id}/stop"),
            )
            .await?;
            println!("{} {}", id, body["status"].as_str().unwrap_or("-"));
        },
        WorkspaceAction::Rm { id } => {
            let body = send_json(
                reqwest::Method::DELETE,
                &format!("{server}/api/v1/workspaces/{id}"),
            )
            .await?;
            println!("{} {}", id, body["status"].as_str().unwrap_or("-"));
        },
    }
    Ok(())
}

pub async fn run_node_action(server: &str, action: NodeAction) -> anyhow::Result<()> {
    match action {
        NodeAction::List => {
            let body = get_json(&format!("{server}/api/v1/nodes")).await?;
            let Some(nodes) = body["nodes"].as_array() else {
                anyhow::bail!("malformed response");
            };
            if nodes.is_empty() {
                println!("no nodes registered");
                return Ok(());
            }
            for node in nodes {
                println!(
                    "{}  {}:{}  {}  [{}]",
                    node["id"].as_str().unwrap_or("-"),
                    node["host"].as_str().unwrap_or("-"),
                    node["port"].as_u64().unwrap_or(0),
                    node["status"].as_str().unwrap_or("-"),
                    node["capabilities"]
                        .as_array()
                        .map(|caps| {
                            caps.iter()
                                .filter_map(|c| c.as_str())
                                .collect::<Vec<_>>()
                                .join(",")
                        })
                        .unwrap_or_default(),
                );
            }
        },
    }
    Ok(())
}
