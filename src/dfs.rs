//! # Distributed File-System Layer
//!
//! A thin tree-of-inodes encoding on top of the overlay's key-value
//! operations. Directories and files are inodes stored under random
//! identifiers; file contents are split into fixed-size chunks, each a
//! value of its own.
//!
//! ## Encoding
//!
//! An inode value is a 1-byte type tag (0x00 file, 0x01 directory)
//! followed by the bincode body. Chunk values are raw bytes.
//!
//! ## Freshness
//!
//! Stored values expire unless read; the DFS layer leans on the overlay's
//! refresh lever by issuing touching reads for every inode and chunk it
//! resolves, so a tree that is being used stays alive. Directory matches
//! during traversal are touched on a background task to keep path walks
//! snappy.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dht::DhtNode;
use crate::identity::NodeId;
use crate::messages;
use crate::protocols::KademliaRpc;

const FILE_INODE_TAG: u8 = 0x00;
const DIR_INODE_TAG: u8 = 0x01;

/// File contents are split into chunks of this many bytes.
pub const FILE_CHUNK_SIZE: usize = 4096;

/// A file: a name plus the ordered chunk identifiers of its contents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInode {
    pub name: String,
    pub blocks: Vec<NodeId>,
}

/// A directory: a name plus the identifiers of its child inodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirInode {
    pub name: String,
    pub children: Vec<NodeId>,
}

/// Decoded inode of either kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inode {
    File(FileInode),
    Dir(DirInode),
}

impl FileInode {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![FILE_INODE_TAG];
        out.extend(messages::serialize(self).context("failed to encode file inode")?);
        Ok(out)
    }
}

impl DirInode {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![DIR_INODE_TAG];
        out.extend(messages::serialize(self).context("failed to encode dir inode")?);
        Ok(out)
    }
}

impl Inode {
    /// Decode a tagged inode value. Untagged or wrong-tagged buffers fail.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes.first() {
            Some(&FILE_INODE_TAG) => Ok(Inode::File(
                messages::deserialize_bounded(&bytes[1..]).context("malformed file inode")?,
            )),
            Some(&DIR_INODE_TAG) => Ok(Inode::Dir(
                messages::deserialize_bounded(&bytes[1..]).context("malformed dir inode")?,
            )),
            Some(tag) => bail!("unknown inode tag: {:#04x}", tag),
            None => bail!("empty inode value"),
        }
    }

    fn name(&self) -> &str {
        match self {
            Inode::File(f) => &f.name,
            Inode::Dir(d) => &d.name,
        }
    }
}

/// File-system view over one overlay node.
pub struct Dfs<N: KademliaRpc> {
    node: DhtNode<N>,
    root_id: NodeId,
}

impl<N: KademliaRpc> Clone for Dfs<N> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            root_id: self.root_id,
        }
    }
}

impl<N: KademliaRpc> Dfs<N> {
    /// Create a fresh tree: an empty root directory stored under a random
    /// identifier. Fails when the root cannot be replicated anywhere.
    pub async fn format(node: DhtNode<N>) -> Result<Self> {
        let root_id = NodeId::random();
        let dfs = Self { node, root_id };
        let root = DirInode {
            name: "/".to_string(),
            children: Vec::new(),
        };
        dfs.store(root_id, &root.encode()?).await?;
        debug!(root = %root_id, "formatted file-system root");
        Ok(dfs)
    }

    /// Attach to an existing tree by its root identifier.
    pub fn attach(node: DhtNode<N>, root_id: NodeId) -> Self {
        Self { node, root_id }
    }

    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    async fn store(&self, key: NodeId, value: &[u8]) -> Result<()> {
        self.node
            .iter_store(key, value.to_vec())
            .await
            .map(|_| ())
            .context("did not store value on any neighbors")
    }

    async fn find(&self, key: NodeId, touch: bool) -> Result<Vec<u8>> {
        let outcome = self.node.iter_find_value(key, touch).await;
        outcome
            .value
            .map(|found| found.value)
            .ok_or_else(|| anyhow!("could not find value for {}", key))
    }

    /// Touching read off the caller's critical path.
    fn touch_background(&self, key: NodeId) {
        let dfs = self.clone();
        tokio::spawn(async move {
            if dfs.find(key, true).await.is_err() {
                warn!(key = %key, "background refresh missed");
            }
        });
    }

    /// Walk `/`-separated components from the root, returning the final
    /// directory's identifier and inode.
    async fn traverse(&self, path: &str) -> Result<(NodeId, DirInode)> {
        let mut current_id = self.root_id;
        let mut current = match Inode::decode(&self.find(current_id, true).await?)? {
            Inode::Dir(dir) => dir,
            Inode::File(_) => bail!("root is not a directory"),
        };

        for component in path.split('/').filter(|p| !p.is_empty()) {
            let mut next = None;
            for child_id in &current.children {
                let data = self.find(*child_id, false).await?;
                if let Inode::Dir(dir) = Inode::decode(&data)? {
                    if dir.name == component {
                        self.touch_background(*child_id);
                        next = Some((*child_id, dir));
                        break;
                    }
                }
            }
            match next {
                Some((id, dir)) => {
                    current_id = id;
                    current = dir;
                }
                None => bail!("could not find path component '{}'", component),
            }
        }
        Ok((current_id, current))
    }

    /// Does `dir` already contain a child (of either kind) named `name`?
    /// Unreadable children are skipped rather than failing the check.
    async fn has_child_named(&self, dir: &DirInode, name: &str) -> bool {
        for child_id in &dir.children {
            if let Ok(data) = self.find(*child_id, false).await {
                if let Ok(inode) = Inode::decode(&data) {
                    if inode.name() == name {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Create an empty directory `name` under `parent_path`.
    pub async fn mkdir(&self, parent_path: &str, name: &str) -> Result<()> {
        let (parent_id, mut parent) = self.traverse(parent_path).await?;
        if self.has_child_named(&parent, name).await {
            bail!("'{}' already exists under {}", name, parent_path);
        }

        let dir_id = NodeId::random();
        let dir = DirInode {
            name: name.to_string(),
            children: Vec::new(),
        };
        self.store(dir_id, &dir.encode()?).await?;

        parent.children.push(dir_id);
        self.store(parent_id, &parent.encode()?).await?;
        Ok(())
    }

    /// Render the entries under `path`: directory names plainly, files as
    /// `file <name>`. Children that cannot be fetched are reported in
    /// place rather than failing the whole listing.
    pub async fn ls(&self, path: &str) -> Result<Vec<String>> {
        let (_, dir) = self.traverse(path).await?;
        let mut entries = Vec::with_capacity(dir.children.len());
        for child_id in &dir.children {
            match self.find(*child_id, false).await {
                Ok(data) => match Inode::decode(&data) {
                    Ok(Inode::Dir(d)) => entries.push(d.name),
                    Ok(Inode::File(f)) => entries.push(format!("file {}", f.name)),
                    Err(_) => entries.push("ERROR undecodable entry".to_string()),
                },
                Err(_) => entries.push("ERROR fetching value".to_string()),
            }
        }
        Ok(entries)
    }

    async fn store_chunks(&self, contents: &[u8]) -> Result<Vec<NodeId>> {
        let mut block_ids = Vec::with_capacity(contents.len().div_ceil(FILE_CHUNK_SIZE));
        for chunk in contents.chunks(FILE_CHUNK_SIZE) {
            let id = NodeId::random();
            self.store(id, chunk).await?;
            block_ids.push(id);
        }
        Ok(block_ids)
    }

    /// Store `contents` as file `name` under `parent_path`.
    pub async fn put(&self, parent_path: &str, name: &str, contents: &[u8]) -> Result<()> {
        let (parent_id, mut parent) = self.traverse(parent_path).await?;
        if self.has_child_named(&parent, name).await {
            bail!("'{}' already exists under {}", name, parent_path);
        }

        let blocks = self.store_chunks(contents).await?;
        let file_id = NodeId::random();
        let file = FileInode {
            name: name.to_string(),
            blocks,
        };
        self.store(file_id, &file.encode()?).await?;

        parent.children.push(file_id);
        self.store(parent_id, &parent.encode()?).await?;
        debug!(file = name, bytes = contents.len(), "stored file");
        Ok(())
    }

    async fn fetch_contents(&self, file: &FileInode) -> Result<Vec<u8>> {
        let mut contents = Vec::new();
        for block_id in &file.blocks {
            let chunk = self
                .find(*block_id, true)
                .await
                .with_context(|| format!("missing chunk {}", block_id))?;
            contents.extend(chunk);
        }
        Ok(contents)
    }

    /// Fetch the contents of file `name` under `parent_path`.
    pub async fn get(&self, parent_path: &str, name: &str) -> Result<Vec<u8>> {
        let (_, parent) = self.traverse(parent_path).await?;
        for child_id in &parent.children {
            let data = self.find(*child_id, false).await?;
            if let Inode::File(file) = Inode::decode(&data)? {
                if file.name == name {
                    self.touch_background(*child_id);
                    return self.fetch_contents(&file).await;
                }
            }
        }
        bail!("could not find file '{}' under {}", name, parent_path)
    }
}
