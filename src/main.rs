use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadfs::{
    Contact, Dfs, DhtNode, FindValueReply, KademliaRpc, NodeId, RpcClient, RpcServer,
};

#[derive(Parser, Debug)]
#[command(name = "kadfs")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on, as host:port.
    listen: String,

    /// Known peer to bootstrap from, as host:port. If identical to the
    /// listen address, no bootstrap is attempted.
    bootstrap: String,
}

fn split_host_port(s: &str) -> Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .with_context(|| format!("invalid address '{}', expected host:port", s))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in '{}'", s))?;
    let host = if host == "localhost" { "127.0.0.1" } else { host };
    Ok((host.to_string(), port))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let (listen_host, listen_port) = split_host_port(&args.listen)?;
    let self_contact = Contact::new(NodeId::random(), listen_host.clone(), listen_port);
    let client = RpcClient::new(self_contact.clone());
    let node = DhtNode::new(self_contact.clone(), client);

    let server = RpcServer::bind(&format!("{}:{}", listen_host, listen_port), node.clone())
        .await
        .context("cannot bind listener")?;
    tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            warn!(error = ?e, "rpc server terminated");
        }
    });
    info!(id = %node.self_id(), addr = %self_contact.addr(), "node listening");

    let mut dfs: Option<Dfs<RpcClient>> = None;
    if args.listen != args.bootstrap {
        let (bootstrap_host, bootstrap_port) = split_host_port(&args.bootstrap)?;
        node.start(&bootstrap_host, bootstrap_port)
            .await
            .context("cannot bootstrap")?;
        match Dfs::format(node.clone()).await {
            Ok(fs) => dfs = Some(fs),
            Err(e) => warn!(error = %e, "file-system root not created yet"),
        }
    }

    repl(node, dfs).await
}

/// Line-oriented command loop. Per-command failures print `ERR` and keep
/// the loop alive; EOF exits cleanly.
async fn repl(node: DhtNode<RpcClient>, dfs: Option<Dfs<RpcClient>>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let command = parts[0].to_ascii_lowercase();
        match dispatch(&node, &dfs, &command, &parts[1..]).await {
            Ok(output) => {
                for out_line in output {
                    println!("{}", out_line);
                }
            }
            Err(e) => println!("ERR {}", e),
        }
    }
    Ok(())
}

fn parse_id(s: &str) -> Result<NodeId> {
    Ok(NodeId::from_hex(s)?)
}

fn resolve(node: &DhtNode<RpcClient>, id_hex: &str) -> Result<Contact> {
    let id = parse_id(id_hex)?;
    node.routing()
        .contact_of(&id)
        .with_context(|| format!("unknown node {}", id_hex))
}

fn ensure_dfs(dfs: &Option<Dfs<RpcClient>>) -> Result<&Dfs<RpcClient>> {
    dfs.as_ref()
        .context("no file-system root; node has no peers yet")
}

async fn dispatch(
    node: &DhtNode<RpcClient>,
    dfs: &Option<Dfs<RpcClient>>,
    command: &str,
    args: &[&str],
) -> Result<Vec<String>> {
    match command {
        "ping" => {
            let [target] = args else {
                bail!("usage: ping <host:port|nodeID>");
            };
            let contact = if target.contains(':') {
                let (host, port) = split_host_port(target)?;
                Contact::new(NodeId::default(), host, port)
            } else {
                resolve(node, target)?
            };
            node.network().ping(&contact).await?;
            Ok(vec!["OK".to_string()])
        }
        "store" => {
            let [id_hex, key_hex, data] = args else {
                bail!("usage: store <nodeID> <keyHex> <ascii>");
            };
            let contact = resolve(node, id_hex)?;
            let key = parse_id(key_hex)?;
            node.network()
                .store(&contact, key, data.as_bytes().to_vec())
                .await?;
            Ok(vec!["OK".to_string()])
        }
        "find_node" => {
            let [id_hex, key_hex] = args else {
                bail!("usage: find_node <nodeID> <keyHex>");
            };
            let contact = resolve(node, id_hex)?;
            let key = parse_id(key_hex)?;
            let nodes = node.network().find_node(&contact, key).await?;
            let mut out = vec!["OK".to_string()];
            out.extend(nodes.iter().map(|c| c.id.to_hex()));
            Ok(out)
        }
        "find_value" => {
            let [id_hex, key_hex] = args else {
                bail!("usage: find_value <nodeID> <keyHex>");
            };
            let contact = resolve(node, id_hex)?;
            let key = parse_id(key_hex)?;
            match node.network().find_value(&contact, key, false).await? {
                FindValueReply::Value(value) => Ok(vec![
                    "OK".to_string(),
                    String::from_utf8_lossy(&value).into_owned(),
                ]),
                FindValueReply::Nodes(nodes) => {
                    let mut out = vec!["OK".to_string()];
                    out.extend(nodes.iter().map(|c| c.id.to_hex()));
                    Ok(out)
                }
            }
        }
        "iterativestore" => {
            let [key_hex, data] = args else {
                bail!("usage: iterativeStore <keyHex> <ascii>");
            };
            let key = parse_id(key_hex)?;
            let stored = node.iter_store(key, data.as_bytes().to_vec()).await?;
            Ok(vec![format!("OK stored on {} nodes", stored)])
        }
        "iterativefindnode" => {
            let [key_hex] = args else {
                bail!("usage: iterativefindnode <keyHex>");
            };
            let key = parse_id(key_hex)?;
            let nodes = node.iter_find_node(key).await;
            let mut out = vec!["OK".to_string()];
            out.extend(nodes.iter().map(|c| c.id.to_hex()));
            Ok(out)
        }
        "iterativefindvalue" => {
            let [key_hex] = args else {
                bail!("usage: iterativefindvalue <keyHex>");
            };
            let key = parse_id(key_hex)?;
            let outcome = node.iter_find_value(key, false).await;
            match outcome.value {
                Some(found) => Ok(vec![
                    "OK".to_string(),
                    format!(
                        "{} {}",
                        found.source.to_hex(),
                        String::from_utf8_lossy(&found.value)
                    ),
                ]),
                None => bail!("value not found"),
            }
        }
        "whoami" => Ok(vec![node.self_id().to_hex()]),
        "local_find_value" => {
            let [key_hex] = args else {
                bail!("usage: local_find_value <keyHex>");
            };
            let key = parse_id(key_hex)?;
            match node.store().get(&key, false) {
                Some(value) => Ok(vec![format!(
                    "OK {}",
                    String::from_utf8_lossy(&value)
                )]),
                None => bail!("no data for key"),
            }
        }
        "get_contact" => {
            let [id_hex] = args else {
                bail!("usage: get_contact <nodeID>");
            };
            let contact = resolve(node, id_hex)?;
            Ok(vec![format!("OK {} {}", contact.host, contact.port)])
        }
        "mkdir" => {
            let [parent_path, name] = args else {
                bail!("usage: mkdir <parentPath> <name>");
            };
            ensure_dfs(dfs)?.mkdir(parent_path, name).await?;
            Ok(vec!["OK".to_string()])
        }
        "ls" => {
            let [path] = args else {
                bail!("usage: ls <path>");
            };
            let entries = ensure_dfs(dfs)?.ls(path).await?;
            let mut out = vec!["OK".to_string()];
            out.extend(entries);
            Ok(out)
        }
        "put" => {
            let [parent_path, name, local_file] = args else {
                bail!("usage: put <parentPath> <name> <localFile>");
            };
            let contents = tokio::fs::read(local_file)
                .await
                .with_context(|| format!("could not read {}", local_file))?;
            ensure_dfs(dfs)?.put(parent_path, name, &contents).await?;
            Ok(vec!["OK".to_string()])
        }
        "get" => {
            let (parent_path, name, local_file) = match args {
                [parent_path, name] => (parent_path, name, None),
                [parent_path, name, local_file] => (parent_path, name, Some(local_file)),
                _ => bail!("usage: get <parentPath> <name> [<localFile>]"),
            };
            let contents = ensure_dfs(dfs)?.get(parent_path, name).await?;
            match local_file {
                Some(path) => {
                    tokio::fs::write(path, &contents)
                        .await
                        .with_context(|| format!("could not write {}", path))?;
                    Ok(vec!["OK".to_string()])
                }
                None => Ok(vec![
                    "OK".to_string(),
                    String::from_utf8_lossy(&contents).into_owned(),
                ]),
            }
        }
        other => {
            bail!(
                "unknown command '{}'; known commands: ping store find_node find_value \
                 iterativeStore iterativefindnode iterativefindvalue whoami \
                 local_find_value get_contact mkdir ls put get",
                other
            )
        }
    }
}
