//! 在途传输登记表：分片到达状态机、完成检测、配额中止与空闲回收。
//!
//! 登记表按 `(client_id, transmission_id)` 保存传输记录。外层互斥锁只在查找、
//! 创建或移除记录时短暂持有；同一传输的读-改-写序列由记录自身的互斥锁串行化，
//! 不同传输之间互不阻塞。加锁顺序固定为「记录锁 → 外层锁」，外层锁持有期间
//! 只允许 `try_lock` 记录锁。

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::assembler::Assembler;
use crate::chunk_store::ChunkStore;
use crate::cleanup::{AssembledFile, discard_chunks};
use crate::quota::{QuotaBreach, QuotaDecision, QuotaEnforcer};

/// 终止分片携带的结构化元数据。
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransmissionKey {
    pub client_id: String,
    pub transmission_id: String,
}

impl TransmissionKey {
    pub fn new(client_id: impl Into<String>, transmission_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            transmission_id: transmission_id.into(),
        }
    }
}

/// 网关交给引擎的单个分片。
#[derive(Debug)]
pub struct IncomingChunk {
    pub key: TransmissionKey,
    /// 从 1 开始。
    pub index: u64,
    pub payload: Vec<u8>,
    pub declared_total_size: Option<u64>,
    pub terminal: Option<TerminalInfo>,
}

/// 只有终止分片携带：原始文件名与未解析的元数据。
#[derive(Debug, Clone)]
pub struct TerminalInfo {
    pub original_filename: String,
    pub metadata: Option<String>,
}

#[derive(Debug)]
pub enum ChunkOutcome {
    Incomplete {
        received: u64,
        expected: Option<u64>,
    },
    Complete(CompletedTransmission),
    QuotaExceeded(QuotaBreach),
}

/// 组装完成的传输。`file` 交给唯一的下游消费者，释放后即被删除。
#[derive(Debug)]
pub struct CompletedTransmission {
    pub file: AssembledFile,
    pub original_filename: String,
    pub metadata: Metadata,
    pub chunk_count: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransmissionSnapshot {
    pub received_chunks: u64,
    pub expected_chunks: Option<u64>,
    pub cumulative_size: u64,
    pub original_filename: Option<String>,
    pub idle_secs: u64,
}

#[derive(Debug)]
pub enum ReassemblyError {
    Storage(io::Error),
    Protocol(ProtocolViolation),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolViolation {
    ZeroIndex,
    TooManyChunks { index: u64, max: u64 },
    DuplicateChunk { index: u64 },
    IndexBeyondTerminal { index: u64, expected: u64 },
    TerminalBelowRecorded { index: u64, highest: u64 },
    TerminalRepeated { expected: u64 },
    TransmissionClosed,
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::ZeroIndex => write!(f, "chunk index must start at 1"),
            ProtocolViolation::TooManyChunks { index, max } => {
                write!(f, "chunk index {index} exceeds limit {max}")
            }
            ProtocolViolation::DuplicateChunk { index } => {
                write!(f, "chunk {index} already received")
            }
            ProtocolViolation::IndexBeyondTerminal { index, expected } => {
                write!(f, "chunk {index} is beyond the final chunk {expected}")
            }
            ProtocolViolation::TerminalBelowRecorded { index, highest } => write!(
                f,
                "final chunk {index} is below already received chunk {highest}"
            ),
            ProtocolViolation::TerminalRepeated { expected } => {
                write!(f, "final chunk already received as {expected}")
            }
            ProtocolViolation::TransmissionClosed => write!(f, "transmission already finished"),
        }
    }
}

impl fmt::Display for ReassemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReassemblyError::Storage(err) => write!(f, "storage error: {err}"),
            ReassemblyError::Protocol(violation) => write!(f, "protocol violation: {violation}"),
        }
    }
}

impl From<io::Error> for ReassemblyError {
    fn from(err: io::Error) -> Self {
        ReassemblyError::Storage(err)
    }
}

impl From<ProtocolViolation> for ReassemblyError {
    fn from(violation: ProtocolViolation) -> Self {
        ReassemblyError::Protocol(violation)
    }
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub work_dir: PathBuf,
    pub max_transmission_size: u64,
    pub max_chunks: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransmissionState {
    Open,
    Completed,
    Aborted(QuotaBreach),
    Cancelled,
    /// 新建后首个分片写入失败而被撤下的空记录，等待者应重新查找。
    Discarded,
}

#[derive(Debug)]
struct Transmission {
    cumulative_size: u64,
    chunk_paths: BTreeMap<u64, PathBuf>,
    expected_count: Option<u64>,
    original_filename: Option<String>,
    metadata: Metadata,
    declared_total_size: Option<u64>,
    last_activity: Instant,
    state: TransmissionState,
}

impl Transmission {
    fn new() -> Self {
        Self {
            cumulative_size: 0,
            chunk_paths: BTreeMap::new(),
            expected_count: None,
            original_filename: None,
            metadata: Metadata::new(),
            declared_total_size: None,
            last_activity: Instant::now(),
            state: TransmissionState::Open,
        }
    }

    fn is_complete(&self) -> bool {
        self.expected_count
            .is_some_and(|expected| self.chunk_paths.len() as u64 == expected)
    }

    fn snapshot(&self) -> TransmissionSnapshot {
        TransmissionSnapshot {
            received_chunks: self.chunk_paths.len() as u64,
            expected_chunks: self.expected_count,
            cumulative_size: self.cumulative_size,
            original_filename: self.original_filename.clone(),
            idle_secs: self.last_activity.elapsed().as_secs(),
        }
    }

    fn check_protocol(&self, chunk: &IncomingChunk) -> Result<(), ProtocolViolation> {
        if self.chunk_paths.contains_key(&chunk.index) {
            return Err(ProtocolViolation::DuplicateChunk { index: chunk.index });
        }
        if let Some(expected) = self.expected_count {
            if chunk.terminal.is_some() {
                return Err(ProtocolViolation::TerminalRepeated { expected });
            }
            if chunk.index > expected {
                return Err(ProtocolViolation::IndexBeyondTerminal {
                    index: chunk.index,
                    expected,
                });
            }
        }
        if chunk.terminal.is_some()
            && let Some(&highest) = self.chunk_paths.keys().next_back()
            && highest > chunk.index
        {
            return Err(ProtocolViolation::TerminalBelowRecorded {
                index: chunk.index,
                highest,
            });
        }
        Ok(())
    }
}

type TransmissionEntry = Arc<Mutex<Transmission>>;

#[derive(Debug, Default)]
struct ClientSession {
    transmissions: HashMap<String, TransmissionEntry>,
}

/// In-memory table of in-flight transmissions, owned by the server for its lifetime.
#[derive(Debug)]
pub struct TransmissionRegistry {
    clients: Mutex<HashMap<String, ClientSession>>,
    store: ChunkStore,
    assembler: Assembler,
    quota: QuotaEnforcer,
    max_chunks: u64,
}

impl TransmissionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            store: ChunkStore::new(config.work_dir.clone()),
            assembler: Assembler::new(config.work_dir),
            quota: QuotaEnforcer::new(config.max_transmission_size),
            max_chunks: config.max_chunks,
        }
    }

    /// 创建工作目录。
    pub async fn init(&self) -> io::Result<()> {
        self.store.ensure_dir().await?;
        info!(work_dir = ?self.store.dir(), "transmission registry ready");
        Ok(())
    }

    /// 处理一个到达的分片。`quota_override` 为本次调用替换默认的大小上限。
    ///
    /// 传输完成、中止或取消后记录即被移除；此后以相同 id 到达的分片会开启一个新的传输。
    pub async fn accept_chunk(
        &self,
        chunk: IncomingChunk,
        quota_override: Option<u64>,
    ) -> Result<ChunkOutcome, ReassemblyError> {
        let key = chunk.key.clone();
        if let Err(violation) = self.check_index(&chunk) {
            warn!(
                client_id = %key.client_id,
                transmission_id = %key.transmission_id,
                chunk_index = chunk.index,
                %violation,
                "chunk rejected"
            );
            return Err(violation.into());
        }

        loop {
            let entry = self.open_entry(&key).await;
            let mut transmission = entry.lock().await;
            match transmission.state {
                TransmissionState::Open => {}
                TransmissionState::Discarded => continue,
                TransmissionState::Aborted(breach) => {
                    return Ok(ChunkOutcome::QuotaExceeded(breach));
                }
                TransmissionState::Completed | TransmissionState::Cancelled => {
                    return Err(ProtocolViolation::TransmissionClosed.into());
                }
            }
            transmission.last_activity = Instant::now();

            if let Err(violation) = transmission.check_protocol(&chunk) {
                warn!(
                    client_id = %key.client_id,
                    transmission_id = %key.transmission_id,
                    chunk_index = chunk.index,
                    %violation,
                    "chunk rejected"
                );
                return Err(violation.into());
            }

            if chunk.declared_total_size.is_some() {
                transmission.declared_total_size = chunk.declared_total_size;
            }
            let prospective = transmission
                .cumulative_size
                .saturating_add(chunk.payload.len() as u64);
            if let QuotaDecision::Abort(breach) =
                self.quota
                    .check(prospective, transmission.declared_total_size, quota_override)
            {
                transmission.state = TransmissionState::Aborted(breach);
                let paths = std::mem::take(&mut transmission.chunk_paths);
                self.detach(&key, &entry).await;
                discard_chunks(paths.values().map(PathBuf::as_path)).await;
                warn!(
                    client_id = %key.client_id,
                    transmission_id = %key.transmission_id,
                    chunk_index = chunk.index,
                    breach = ?breach,
                    discarded = paths.len(),
                    "transmission exceeded quota"
                );
                return Ok(ChunkOutcome::QuotaExceeded(breach));
            }

            let path = match self.store.write_chunk(&chunk.payload).await {
                Ok(path) => path,
                Err(err) => {
                    if transmission.chunk_paths.is_empty() {
                        transmission.state = TransmissionState::Discarded;
                        self.detach(&key, &entry).await;
                    }
                    warn!(
                        client_id = %key.client_id,
                        transmission_id = %key.transmission_id,
                        chunk_index = chunk.index,
                        error = %err,
                        "failed to store chunk"
                    );
                    return Err(err.into());
                }
            };
            transmission.chunk_paths.insert(chunk.index, path);
            transmission.cumulative_size = prospective;

            if let Some(terminal) = &chunk.terminal {
                transmission.expected_count = Some(chunk.index);
                transmission.original_filename = Some(terminal.original_filename.clone());
                transmission.metadata = parse_metadata(&key, terminal.metadata.as_deref());
            }

            debug!(
                client_id = %key.client_id,
                transmission_id = %key.transmission_id,
                chunk_index = chunk.index,
                bytes = chunk.payload.len(),
                cumulative = transmission.cumulative_size,
                "chunk stored"
            );

            if transmission.is_complete() {
                return self.complete(&key, &entry, &mut transmission).await;
            }
            return Ok(ChunkOutcome::Incomplete {
                received: transmission.chunk_paths.len() as u64,
                expected: transmission.expected_count,
            });
        }
    }

    /// 显式放弃一个在途传输。传输不存在时返回 `false`。
    pub async fn cancel(&self, key: &TransmissionKey) -> bool {
        let Some(entry) = self.lookup(key).await else {
            return false;
        };
        let mut transmission = entry.lock().await;
        if transmission.state != TransmissionState::Open {
            return false;
        }
        transmission.state = TransmissionState::Cancelled;
        let paths = std::mem::take(&mut transmission.chunk_paths);
        self.detach(key, &entry).await;
        discard_chunks(paths.values().map(PathBuf::as_path)).await;
        info!(
            client_id = %key.client_id,
            transmission_id = %key.transmission_id,
            discarded = paths.len(),
            "transmission cancelled"
        );
        true
    }

    pub async fn snapshot(&self, key: &TransmissionKey) -> Option<TransmissionSnapshot> {
        let entry = self.lookup(key).await?;
        let transmission = entry.lock().await;
        (transmission.state == TransmissionState::Open).then(|| transmission.snapshot())
    }

    /// 回收空闲超过 `ttl` 的传输，返回回收数量。正在被处理的传输会被跳过。
    pub async fn sweep_idle(&self, ttl: Duration) -> usize {
        if ttl.is_zero() {
            return 0;
        }
        let mut stale = Vec::new();
        {
            let mut clients = self.clients.lock().await;
            for (client_id, session) in clients.iter_mut() {
                session.transmissions.retain(|transmission_id, entry| {
                    let Ok(mut transmission) = entry.try_lock() else {
                        return true;
                    };
                    if transmission.last_activity.elapsed() < ttl {
                        return true;
                    }
                    transmission.state = TransmissionState::Cancelled;
                    stale.push((
                        TransmissionKey::new(client_id.clone(), transmission_id.clone()),
                        std::mem::take(&mut transmission.chunk_paths),
                    ));
                    false
                });
            }
            clients.retain(|_, session| !session.transmissions.is_empty());
        }

        for (key, paths) in &stale {
            discard_chunks(paths.values().map(PathBuf::as_path)).await;
            info!(
                client_id = %key.client_id,
                transmission_id = %key.transmission_id,
                discarded = paths.len(),
                "idle transmission reaped"
            );
        }
        stale.len()
    }

    /// 关闭登记表：丢弃所有在途传输及其分片文件。
    pub async fn shutdown(&self) -> usize {
        let entries: Vec<TransmissionEntry> = {
            let mut clients = self.clients.lock().await;
            clients
                .drain()
                .flat_map(|(_, session)| session.transmissions.into_values())
                .collect()
        };
        let count = entries.len();
        for entry in entries {
            let mut transmission = entry.lock().await;
            if transmission.state == TransmissionState::Open {
                transmission.state = TransmissionState::Cancelled;
            }
            let paths = std::mem::take(&mut transmission.chunk_paths);
            discard_chunks(paths.values().map(PathBuf::as_path)).await;
        }
        if count > 0 {
            info!(count, "discarded in-flight transmissions on shutdown");
        }
        count
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn transmission_count(&self) -> usize {
        self.clients
            .lock()
            .await
            .values()
            .map(|session| session.transmissions.len())
            .sum()
    }

    fn check_index(&self, chunk: &IncomingChunk) -> Result<(), ProtocolViolation> {
        if chunk.index == 0 {
            return Err(ProtocolViolation::ZeroIndex);
        }
        if self.max_chunks > 0 && chunk.index > self.max_chunks {
            return Err(ProtocolViolation::TooManyChunks {
                index: chunk.index,
                max: self.max_chunks,
            });
        }
        Ok(())
    }

    async fn complete(
        &self,
        key: &TransmissionKey,
        entry: &TransmissionEntry,
        transmission: &mut Transmission,
    ) -> Result<ChunkOutcome, ReassemblyError> {
        transmission.state = TransmissionState::Completed;
        self.detach(key, entry).await;

        let chunk_paths = std::mem::take(&mut transmission.chunk_paths);
        let expected = transmission.expected_count.unwrap_or_default();
        let original_filename = transmission.original_filename.take().unwrap_or_default();
        match self
            .assembler
            .assemble(&chunk_paths, expected, Some(original_filename.as_str()))
            .await
        {
            Ok(file) => {
                info!(
                    client_id = %key.client_id,
                    transmission_id = %key.transmission_id,
                    chunks = expected,
                    bytes = file.size(),
                    name = original_filename,
                    "transmission assembled"
                );
                Ok(ChunkOutcome::Complete(CompletedTransmission {
                    file,
                    original_filename,
                    metadata: std::mem::take(&mut transmission.metadata),
                    chunk_count: expected,
                }))
            }
            Err(err) => {
                discard_chunks(chunk_paths.values().map(PathBuf::as_path)).await;
                warn!(
                    client_id = %key.client_id,
                    transmission_id = %key.transmission_id,
                    error = %err,
                    "assembly failed"
                );
                Err(err.into())
            }
        }
    }

    async fn open_entry(&self, key: &TransmissionKey) -> TransmissionEntry {
        let mut clients = self.clients.lock().await;
        clients
            .entry(key.client_id.clone())
            .or_default()
            .transmissions
            .entry(key.transmission_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Transmission::new())))
            .clone()
    }

    async fn lookup(&self, key: &TransmissionKey) -> Option<TransmissionEntry> {
        let clients = self.clients.lock().await;
        clients
            .get(&key.client_id)?
            .transmissions
            .get(&key.transmission_id)
            .cloned()
    }

    /// 从登记表移除记录；客户端下已无传输时一并移除客户端。
    async fn detach(&self, key: &TransmissionKey, entry: &TransmissionEntry) {
        let mut clients = self.clients.lock().await;
        let Some(session) = clients.get_mut(&key.client_id) else {
            return;
        };
        if session
            .transmissions
            .get(&key.transmission_id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            session.transmissions.remove(&key.transmission_id);
        }
        if session.transmissions.is_empty() {
            clients.remove(&key.client_id);
        }
    }
}

fn parse_metadata(key: &TransmissionKey, raw: Option<&str>) -> Metadata {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Metadata::new();
    };
    match serde_json::from_str::<Metadata>(raw) {
        Ok(metadata) => metadata,
        Err(err) => {
            warn!(
                client_id = %key.client_id,
                transmission_id = %key.transmission_id,
                error = %err,
                "invalid transmission metadata, using empty metadata"
            );
            Metadata::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    const KIB: u64 = 1024;

    fn make_registry(max_size: u64) -> (tempfile::TempDir, PathBuf, Arc<TransmissionRegistry>) {
        let temp = tempdir().expect("tempdir");
        let work_dir = temp.path().join("work");
        std::fs::create_dir_all(&work_dir).expect("create work dir");
        let registry = TransmissionRegistry::new(RegistryConfig {
            work_dir: work_dir.clone(),
            max_transmission_size: max_size,
            max_chunks: 64,
        });
        (temp, work_dir, Arc::new(registry))
    }

    fn chunk(client: &str, transmission: &str, index: u64, payload: &[u8]) -> IncomingChunk {
        IncomingChunk {
            key: TransmissionKey::new(client, transmission),
            index,
            payload: payload.to_vec(),
            declared_total_size: None,
            terminal: None,
        }
    }

    fn terminal(
        client: &str,
        transmission: &str,
        index: u64,
        payload: &[u8],
        name: &str,
        metadata: Option<&str>,
    ) -> IncomingChunk {
        IncomingChunk {
            terminal: Some(TerminalInfo {
                original_filename: name.to_string(),
                metadata: metadata.map(str::to_string),
            }),
            ..chunk(client, transmission, index, payload)
        }
    }

    fn file_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).expect("read work dir").count()
    }

    fn payload(index: u64) -> Vec<u8> {
        vec![b'a' + index as u8; 10]
    }

    fn permutations(items: &[u64]) -> Vec<Vec<u64>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut result = Vec::new();
        for (position, &first) in items.iter().enumerate() {
            let mut rest = items.to_vec();
            rest.remove(position);
            for mut tail in permutations(&rest) {
                tail.insert(0, first);
                result.push(tail);
            }
        }
        result
    }

    async fn expect_complete(outcome: ChunkOutcome) -> (Vec<u8>, CompletedTransmission) {
        match outcome {
            ChunkOutcome::Complete(done) => {
                let bytes = tokio::fs::read(done.file.path()).await.expect("read output");
                (bytes, done)
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn out_of_order_chunks_assemble_in_index_order() {
        let (_temp, work_dir, registry) = make_registry(KIB);

        let first = registry
            .accept_chunk(chunk("c1", "t1", 2, &payload(2)), None)
            .await
            .expect("chunk 2");
        assert!(matches!(
            first,
            ChunkOutcome::Incomplete {
                received: 1,
                expected: None
            }
        ));
        registry
            .accept_chunk(chunk("c1", "t1", 1, &payload(1)), None)
            .await
            .expect("chunk 1");
        let mut last = terminal("c1", "t1", 3, &payload(3), "photo.png", None);
        last.declared_total_size = Some(30);
        let outcome = registry.accept_chunk(last, None).await.expect("chunk 3");

        let (bytes, done) = expect_complete(outcome).await;
        let expected: Vec<u8> = [payload(1), payload(2), payload(3)].concat();
        assert_eq!(bytes, expected);
        assert_eq!(done.original_filename, "photo.png");
        assert_eq!(done.chunk_count, 3);
        assert_eq!(
            done.file.path().extension().and_then(|e| e.to_str()),
            Some("png")
        );
        assert_eq!(registry.transmission_count().await, 0);
        assert_eq!(registry.client_count().await, 0);
        assert_eq!(file_count(&work_dir), 1, "only the assembled file remains");

        done.file.release().await.expect("release");
        assert_eq!(file_count(&work_dir), 0);
    }

    #[tokio::test]
    async fn every_arrival_order_yields_the_same_bytes() {
        let (_temp, work_dir, registry) = make_registry(KIB);
        let expected: Vec<u8> = (1..=4).flat_map(payload).collect();

        for (run, order) in permutations(&[1, 2, 3, 4]).into_iter().enumerate() {
            let transmission = format!("t{run}");
            let mut outcome = None;
            for index in order {
                let incoming = if index == 4 {
                    terminal("c1", &transmission, index, &payload(index), "f.bin", None)
                } else {
                    chunk("c1", &transmission, index, &payload(index))
                };
                outcome = Some(registry.accept_chunk(incoming, None).await.expect("chunk"));
            }
            let (bytes, done) = expect_complete(outcome.expect("outcome")).await;
            assert_eq!(bytes, expected, "run {run}");
            done.file.release().await.expect("release");
        }
        assert_eq!(file_count(&work_dir), 0);
        assert_eq!(registry.client_count().await, 0);
    }

    #[tokio::test]
    async fn observed_size_over_ceiling_aborts_and_cleans_up() {
        let (_temp, work_dir, registry) = make_registry(15);

        let first = registry
            .accept_chunk(chunk("c1", "t1", 2, &payload(2)), None)
            .await
            .expect("chunk 2");
        assert!(matches!(first, ChunkOutcome::Incomplete { .. }));
        assert_eq!(file_count(&work_dir), 1);

        let second = registry
            .accept_chunk(chunk("c1", "t1", 1, &payload(1)), None)
            .await
            .expect("chunk 1");
        assert!(matches!(
            second,
            ChunkOutcome::QuotaExceeded(QuotaBreach::Observed {
                observed: 20,
                ceiling: 15
            })
        ));
        assert_eq!(file_count(&work_dir), 0);
        assert_eq!(registry.transmission_count().await, 0);
        assert_eq!(registry.client_count().await, 0);
    }

    #[tokio::test]
    async fn declared_size_over_ceiling_aborts_without_writing() {
        let (_temp, work_dir, registry) = make_registry(15);
        let mut incoming = chunk("c1", "t1", 1, b"tiny");
        incoming.declared_total_size = Some(1_000);

        let outcome = registry.accept_chunk(incoming, None).await.expect("chunk");
        assert!(matches!(
            outcome,
            ChunkOutcome::QuotaExceeded(QuotaBreach::Declared { .. })
        ));
        assert_eq!(file_count(&work_dir), 0);
        assert_eq!(registry.client_count().await, 0);
    }

    #[tokio::test]
    async fn chunk_after_quota_abort_starts_fresh_transmission() {
        let (_temp, work_dir, registry) = make_registry(15);
        let mut oversized = chunk("c1", "t1", 1, b"a");
        oversized.declared_total_size = Some(100);
        let aborted = registry.accept_chunk(oversized, None).await.expect("chunk");
        assert!(matches!(aborted, ChunkOutcome::QuotaExceeded(_)));

        let fresh = registry
            .accept_chunk(chunk("c1", "t1", 1, b"a"), None)
            .await
            .expect("late chunk");
        assert!(matches!(
            fresh,
            ChunkOutcome::Incomplete {
                received: 1,
                expected: None
            }
        ));
        assert_eq!(file_count(&work_dir), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn per_call_override_replaces_default_ceiling() {
        let (_temp, _work_dir, registry) = make_registry(15);
        registry
            .accept_chunk(chunk("c1", "t1", 1, &payload(1)), Some(KIB))
            .await
            .expect("chunk 1");
        let outcome = registry
            .accept_chunk(terminal("c1", "t1", 2, &payload(2), "a", None), Some(KIB))
            .await
            .expect("chunk 2");
        let (bytes, done) = expect_complete(outcome).await;
        assert_eq!(bytes.len(), 20);
        done.file.release().await.expect("release");
    }

    #[tokio::test]
    async fn invalid_metadata_falls_back_to_empty() {
        let (_temp, _work_dir, registry) = make_registry(KIB);
        let outcome = registry
            .accept_chunk(
                terminal("c1", "t1", 1, b"x", "a.txt", Some("{not json")),
                None,
            )
            .await
            .expect("terminal chunk");
        let (_, done) = expect_complete(outcome).await;
        assert!(done.metadata.is_empty());
        done.file.release().await.expect("release");

        let outcome = registry
            .accept_chunk(
                terminal("c1", "t2", 1, b"x", "a.txt", Some(r#"{"album":"trip"}"#)),
                None,
            )
            .await
            .expect("terminal chunk");
        let (_, done) = expect_complete(outcome).await;
        assert_eq!(
            done.metadata.get("album").and_then(|v| v.as_str()),
            Some("trip")
        );
        done.file.release().await.expect("release");
    }

    #[tokio::test]
    async fn duplicate_index_is_rejected_without_orphans() {
        let (_temp, work_dir, registry) = make_registry(KIB);
        registry
            .accept_chunk(chunk("c1", "t1", 1, b"first"), None)
            .await
            .expect("chunk 1");

        let result = registry
            .accept_chunk(chunk("c1", "t1", 1, b"second"), None)
            .await;
        assert!(matches!(
            result,
            Err(ReassemblyError::Protocol(ProtocolViolation::DuplicateChunk {
                index: 1
            }))
        ));
        assert_eq!(file_count(&work_dir), 1);

        let outcome = registry
            .accept_chunk(terminal("c1", "t1", 2, b"!", "a", None), None)
            .await
            .expect("terminal");
        let (bytes, done) = expect_complete(outcome).await;
        assert_eq!(bytes, b"first!");
        done.file.release().await.expect("release");
    }

    #[tokio::test]
    async fn indices_inconsistent_with_terminal_are_rejected() {
        let (_temp, _work_dir, registry) = make_registry(KIB);
        registry
            .accept_chunk(terminal("c1", "t1", 3, b"c", "a", None), None)
            .await
            .expect("terminal");

        let beyond = registry.accept_chunk(chunk("c1", "t1", 4, b"d"), None).await;
        assert!(matches!(
            beyond,
            Err(ReassemblyError::Protocol(
                ProtocolViolation::IndexBeyondTerminal {
                    index: 4,
                    expected: 3
                }
            ))
        ));
        let repeated = registry
            .accept_chunk(terminal("c1", "t1", 2, b"b", "a", None), None)
            .await;
        assert!(matches!(
            repeated,
            Err(ReassemblyError::Protocol(
                ProtocolViolation::TerminalRepeated { expected: 3 }
            ))
        ));

        registry
            .accept_chunk(chunk("c1", "t2", 5, b"e"), None)
            .await
            .expect("chunk 5");
        let below = registry
            .accept_chunk(terminal("c1", "t2", 2, b"b", "a", None), None)
            .await;
        assert!(matches!(
            below,
            Err(ReassemblyError::Protocol(
                ProtocolViolation::TerminalBelowRecorded {
                    index: 2,
                    highest: 5
                }
            ))
        ));

        let zero = registry.accept_chunk(chunk("c1", "t3", 0, b"z"), None).await;
        assert!(matches!(
            zero,
            Err(ReassemblyError::Protocol(ProtocolViolation::ZeroIndex))
        ));
        let too_many = registry.accept_chunk(chunk("c1", "t3", 65, b"z"), None).await;
        assert!(matches!(
            too_many,
            Err(ReassemblyError::Protocol(ProtocolViolation::TooManyChunks { .. }))
        ));
        assert_eq!(registry.transmission_count().await, 2);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transmissions_do_not_interfere() {
        let (_temp, work_dir, registry) = make_registry(KIB);
        let mut handles = Vec::new();
        for client in 0..4 {
            for transmission in 0..4 {
                for index in 1..=4u64 {
                    let registry = registry.clone();
                    handles.push(tokio::spawn(async move {
                        let client = format!("c{client}");
                        let transmission = format!("t{transmission}");
                        let bytes = format!("{client}{transmission}-{index};").into_bytes();
                        let incoming = if index == 4 {
                            terminal(&client, &transmission, index, &bytes, "f", None)
                        } else {
                            chunk(&client, &transmission, index, &bytes)
                        };
                        let outcome = registry.accept_chunk(incoming, None).await;
                        (client, transmission, outcome)
                    }));
                }
            }
        }

        let mut completed = 0;
        for handle in handles {
            let (client, transmission, outcome) = handle.await.expect("join");
            if let ChunkOutcome::Complete(done) = outcome.expect("chunk accepted") {
                let bytes = tokio::fs::read(done.file.path()).await.expect("read output");
                let expected: String = (1..=4)
                    .map(|index| format!("{client}{transmission}-{index};"))
                    .collect();
                assert_eq!(String::from_utf8_lossy(&bytes), expected);
                done.file.release().await.expect("release");
                completed += 1;
            }
        }
        assert_eq!(completed, 16);
        assert_eq!(registry.client_count().await, 0);
        assert_eq!(file_count(&work_dir), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_chunks_of_one_transmission_complete_once() {
        let (_temp, work_dir, registry) = make_registry(KIB);
        let mut handles = Vec::new();
        for index in 1..=8u64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let incoming = if index == 8 {
                    terminal("c1", "t1", index, &payload(index), "f", None)
                } else {
                    chunk("c1", "t1", index, &payload(index))
                };
                registry.accept_chunk(incoming, None).await
            }));
        }

        let mut completions = Vec::new();
        for handle in handles {
            if let ChunkOutcome::Complete(done) = handle.await.expect("join").expect("chunk") {
                completions.push(done);
            }
        }
        assert_eq!(completions.len(), 1);
        let done = completions.pop().expect("completion");
        let bytes = tokio::fs::read(done.file.path()).await.expect("read output");
        let expected: Vec<u8> = (1..=8).flat_map(payload).collect();
        assert_eq!(bytes, expected);
        done.file.release().await.expect("release");
        assert_eq!(file_count(&work_dir), 0);
    }

    #[tokio::test]
    async fn finished_client_is_removed_while_others_remain() {
        let (_temp, _work_dir, registry) = make_registry(KIB);
        registry
            .accept_chunk(chunk("c1", "t1", 1, b"a"), None)
            .await
            .expect("c1 chunk");
        registry
            .accept_chunk(chunk("c2", "t1", 1, b"a"), None)
            .await
            .expect("c2 chunk");
        assert_eq!(registry.client_count().await, 2);

        let outcome = registry
            .accept_chunk(terminal("c1", "t1", 2, b"b", "a", None), None)
            .await
            .expect("c1 terminal");
        let (_, done) = expect_complete(outcome).await;
        done.file.release().await.expect("release");

        assert_eq!(registry.client_count().await, 1);
        let snapshot = registry
            .snapshot(&TransmissionKey::new("c2", "t1"))
            .await
            .expect("c2 still in flight");
        assert_eq!(snapshot.received_chunks, 1);
        assert_eq!(snapshot.cumulative_size, 1);
        assert!(registry.snapshot(&TransmissionKey::new("c1", "t1")).await.is_none());
    }

    #[tokio::test]
    async fn assembly_failure_discards_remaining_chunks() {
        let (_temp, work_dir, registry) = make_registry(KIB);
        registry
            .accept_chunk(chunk("c1", "t1", 1, &payload(1)), None)
            .await
            .expect("chunk 1");
        registry
            .accept_chunk(chunk("c1", "t1", 2, &payload(2)), None)
            .await
            .expect("chunk 2");
        let stored: Vec<PathBuf> = std::fs::read_dir(&work_dir)
            .expect("read work dir")
            .map(|entry| entry.expect("dir entry").path())
            .collect();
        assert_eq!(stored.len(), 2);
        std::fs::remove_file(&stored[0]).expect("remove one chunk");

        let result = registry
            .accept_chunk(terminal("c1", "t1", 3, &payload(3), "f.bin", None), None)
            .await;

        assert!(matches!(result, Err(ReassemblyError::Storage(_))));
        assert_eq!(file_count(&work_dir), 0);
        assert_eq!(registry.client_count().await, 0);
        assert!(registry.snapshot(&TransmissionKey::new("c1", "t1")).await.is_none());
    }

    #[tokio::test]
    async fn failed_first_write_leaves_no_entry() {
        let (_temp, work_dir, registry) = make_registry(KIB);
        std::fs::remove_dir(&work_dir).expect("remove work dir");

        let result = registry
            .accept_chunk(chunk("c1", "t1", 1, b"a"), None)
            .await;
        assert!(matches!(result, Err(ReassemblyError::Storage(_))));
        assert_eq!(registry.client_count().await, 0);
        assert_eq!(registry.transmission_count().await, 0);

        registry.init().await.expect("recreate work dir");
        let outcome = registry
            .accept_chunk(chunk("c1", "t1", 1, b"a"), None)
            .await
            .expect("retry after recovery");
        assert!(matches!(
            outcome,
            ChunkOutcome::Incomplete {
                received: 1,
                expected: None
            }
        ));
        assert_eq!(file_count(&work_dir), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_discards_chunks() {
        let (_temp, work_dir, registry) = make_registry(KIB);
        registry
            .accept_chunk(chunk("c1", "t1", 1, b"a"), None)
            .await
            .expect("chunk");
        let key = TransmissionKey::new("c1", "t1");

        assert!(registry.cancel(&key).await);
        assert!(!registry.cancel(&key).await);
        assert_eq!(file_count(&work_dir), 0);
        assert_eq!(registry.client_count().await, 0);
    }

    #[tokio::test]
    async fn idle_sweep_reaps_stale_transmissions() {
        let (_temp, work_dir, registry) = make_registry(KIB);
        registry
            .accept_chunk(chunk("c1", "t1", 1, b"a"), None)
            .await
            .expect("chunk");
        assert_eq!(registry.sweep_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.sweep_idle(Duration::ZERO).await, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.sweep_idle(Duration::from_millis(5)).await, 1);
        assert_eq!(file_count(&work_dir), 0);
        assert_eq!(registry.client_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_discards_everything_in_flight() {
        let (_temp, work_dir, registry) = make_registry(KIB);
        for client in ["c1", "c2"] {
            registry
                .accept_chunk(chunk(client, "t1", 1, b"a"), None)
                .await
                .expect("chunk");
        }
        assert_eq!(registry.shutdown().await, 2);
        assert_eq!(file_count(&work_dir), 0);
        assert_eq!(registry.client_count().await, 0);
    }
}
