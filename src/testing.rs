//! In-memory ledgers and connection stubs shared by unit tests

use crate::chain::{Connection, Connector, LogSource};
use crate::config::{ChainConfig, GasPriceStrategy, Settings};
use crate::coordination::FinalizationWorkflow;
use crate::error::{RelayerError, RelayerResult};
use crate::governance::{
    ErrorDecoder, MainGovernance, MainProposal, MirrorRequest, ProposalId, ProposalStatus,
    SecondaryGovernance, SecondaryMirror, SecondaryVoteCollection,
};
use crate::state::IdempotencyCache;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, Filter, Log, U256};
use futures::stream::{self, BoxStream};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const SETTINGS: &str = r#"
    [relayer]
    instance_id = "relayer-test"
    retry_delay_ms = 1
    reconnect_base_delay_ms = 1
    reconnect_max_delay_ms = 4

    [cache]
    path = "data/relayer-state.json"

    [api]
    host = "127.0.0.1"
    port = 8080

    [metrics]
    enabled = false
    port = 9090

    [main]
    chain_id = 1
    name = "main"
    rpc_urls = ["http://localhost:8545"]
    governance_address = "0x0000000000000000000000000000000000000001"

    [secondaries.polygon]
    chain_id = 137
    name = "polygon"
    rpc_urls = ["http://localhost:8546"]
    governance_address = "0x0000000000000000000000000000000000000002"

    [wallet]
"#;

pub fn settings() -> Settings {
    Settings::from_toml_str(SETTINGS).unwrap()
}

pub fn chain_config(chain_id: u64) -> ChainConfig {
    ChainConfig {
        chain_id,
        name: format!("chain-{}", chain_id),
        rpc_urls: vec!["http://localhost:8545".to_string()],
        ws_url: None,
        governance_address: "0x0000000000000000000000000000000000000001".to_string(),
        confirmation_blocks: 1,
        gas_price_strategy: GasPriceStrategy::Eip1559,
        max_gas_price_gwei: 500,
        enabled: true,
    }
}

// Connections

#[derive(Default)]
struct StubState {
    failures: HashMap<u64, u32>,
    connects: HashMap<u64, u32>,
    alive: HashMap<u64, Arc<AtomicBool>>,
    heads: HashMap<u64, u64>,
    head_reads: HashMap<u64, u32>,
    logs: HashMap<u64, Vec<Log>>,
    log_queries: HashMap<u64, Vec<(u64, u64)>>,
    /// Chains that stream; the logs are handed to the first subscriber
    streams: HashMap<u64, Vec<Log>>,
}

/// Connector whose dial results are scripted per chain
#[derive(Clone, Default)]
pub struct StubConnector {
    state: Arc<Mutex<StubState>>,
}

impl StubConnector {
    /// Fail the next `n` dials of `chain_id`
    pub fn fail_next(&self, chain_id: u64, n: u32) {
        self.state.lock().unwrap().failures.insert(chain_id, n);
    }

    /// Make the chain's current connection stop answering
    pub fn kill(&self, chain_id: u64) {
        if let Some(alive) = self.state.lock().unwrap().alive.get(&chain_id) {
            alive.store(false, Ordering::SeqCst);
        }
    }

    /// Successful dials so far
    pub fn connects(&self, chain_id: u64) -> u32 {
        self.state
            .lock()
            .unwrap()
            .connects
            .get(&chain_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_head(&self, chain_id: u64, block: u64) {
        self.state.lock().unwrap().heads.insert(chain_id, block);
    }

    /// Times the chain head was read
    pub fn head_reads(&self, chain_id: u64) -> u32 {
        self.state
            .lock()
            .unwrap()
            .head_reads
            .get(&chain_id)
            .copied()
            .unwrap_or(0)
    }

    /// Make a log visible to range queries
    pub fn push_log(&self, chain_id: u64, log: Log) {
        self.state
            .lock()
            .unwrap()
            .logs
            .entry(chain_id)
            .or_default()
            .push(log);
    }

    /// Block ranges queried so far, in order
    pub fn log_queries(&self, chain_id: u64) -> Vec<(u64, u64)> {
        self.state
            .lock()
            .unwrap()
            .log_queries
            .get(&chain_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Give the chain a subscription that yields `logs` once, then closes
    pub fn set_stream(&self, chain_id: u64, logs: Vec<Log>) {
        self.state.lock().unwrap().streams.insert(chain_id, logs);
    }
}

pub struct StubConnection {
    chain_id: u64,
    alive: Arc<AtomicBool>,
    state: Arc<Mutex<StubState>>,
}

#[async_trait]
impl Connection for StubConnection {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StubConnector {
    type Conn = StubConnection;

    async fn connect(&self, endpoint: &ChainConfig) -> RelayerResult<Arc<StubConnection>> {
        let chain_id = endpoint.chain_id;
        let mut state = self.state.lock().unwrap();

        if let Some(remaining) = state.failures.get_mut(&chain_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RelayerError::ChainConnection {
                    chain_id,
                    message: "connection refused".to_string(),
                });
            }
        }

        *state.connects.entry(chain_id).or_insert(0) += 1;
        let alive = Arc::new(AtomicBool::new(true));
        state.alive.insert(chain_id, alive.clone());
        Ok(Arc::new(StubConnection {
            chain_id,
            alive,
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl LogSource for StubConnection {
    async fn block_number(&self) -> RelayerResult<u64> {
        let mut state = self.state.lock().unwrap();
        *state.head_reads.entry(self.chain_id).or_insert(0) += 1;
        Ok(state.heads.get(&self.chain_id).copied().unwrap_or(0))
    }

    async fn logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        let from = filter.get_from_block().map(|b| b.as_u64()).unwrap_or(0);
        let to = filter.get_to_block().map(|b| b.as_u64()).unwrap_or(u64::MAX);
        let mut state = self.state.lock().unwrap();
        state
            .log_queries
            .entry(self.chain_id)
            .or_default()
            .push((from, to));
        Ok(state
            .logs
            .get(&self.chain_id)
            .into_iter()
            .flatten()
            .filter(|log| {
                let block = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
                (from..=to).contains(&block)
            })
            .cloned()
            .collect())
    }

    async fn subscribe<'a>(&'a self, _filter: &'a Filter) -> RelayerResult<Option<BoxStream<'a, Log>>> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .streams
            .get_mut(&self.chain_id)
            .map(|logs| Box::pin(stream::iter(std::mem::take(logs))) as BoxStream<'a, Log>))
    }
}

// Governance ledgers

/// Successful writes across all ledgers, in order
pub type CallLog = Arc<Mutex<Vec<String>>>;

fn revert(chain_id: u64, name: &str, args: Vec<Token>) -> RelayerError {
    RelayerError::Revert {
        chain_id,
        message: "execution reverted".to_string(),
        data: ErrorDecoder::global().encode(name, &args),
    }
}

fn uint(n: u64) -> Token {
    Token::Uint(U256::from(n))
}

#[derive(Default)]
struct MainState {
    now: u64,
    proposals: BTreeMap<ProposalId, MainProposal>,
    collections: HashMap<(ProposalId, u64), SecondaryVoteCollection>,
}

/// Main governance module held in memory
pub struct MockMain {
    chain_id: u64,
    registered: Vec<u64>,
    state: Mutex<MainState>,
    log: CallLog,
}

impl MockMain {
    pub fn new(chain_id: u64, registered: Vec<u64>) -> Self {
        Self {
            chain_id,
            registered,
            state: Mutex::new(MainState::default()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn add_proposal(&self, id: ProposalId, start_time: u64, end_time: u64) {
        let proposal = MainProposal {
            id,
            title: format!("Proposal {}", id),
            content_hash: [id as u8; 32],
            proposer: Address::repeat_byte(0xaa),
            start_time,
            end_time,
            yes_votes: U256::zero(),
            no_votes: U256::zero(),
            status: ProposalStatus::Pending,
            final_yes_votes: U256::zero(),
            final_no_votes: U256::zero(),
            vote_tally_finalized: false,
            executed: false,
        };
        self.state.lock().unwrap().proposals.insert(id, proposal);
    }

    pub fn set_votes(&self, id: ProposalId, yes: u64, no: u64) {
        if let Some(p) = self.state.lock().unwrap().proposals.get_mut(&id) {
            p.yes_votes = U256::from(yes);
            p.no_votes = U256::from(no);
        }
    }

    pub fn set_time(&self, now: u64) {
        self.state.lock().unwrap().now = now;
    }

    /// Jump a proposal straight to a finalized, accepted tally
    pub fn force_finalized(&self, id: ProposalId, executed: bool) {
        if let Some(p) = self.state.lock().unwrap().proposals.get_mut(&id) {
            p.vote_tally_finalized = true;
            p.final_yes_votes = U256::one();
            p.final_no_votes = U256::zero();
            p.executed = executed;
            p.status = if executed {
                ProposalStatus::Executed
            } else {
                ProposalStatus::Accepted
            };
        }
    }

    /// Finalize a proposal with the module's own verdict, which need not
    /// follow the totals
    pub fn force_tally(&self, id: ProposalId, yes: u64, no: u64, status: ProposalStatus) {
        if let Some(p) = self.state.lock().unwrap().proposals.get_mut(&id) {
            p.vote_tally_finalized = true;
            p.final_yes_votes = U256::from(yes);
            p.final_no_votes = U256::from(no);
            p.status = status;
        }
    }

    pub fn proposal_snapshot(&self, id: ProposalId) -> MainProposal {
        self.state.lock().unwrap().proposals[&id].clone()
    }

    fn record(&self, call: String) {
        self.log.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MainGovernance for MockMain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn latest_timestamp(&self) -> RelayerResult<u64> {
        Ok(self.state.lock().unwrap().now)
    }

    async fn proposal_ids(&self) -> RelayerResult<Vec<ProposalId>> {
        Ok(self.state.lock().unwrap().proposals.keys().copied().collect())
    }

    async fn proposal(&self, id: ProposalId) -> RelayerResult<MainProposal> {
        self.state
            .lock()
            .unwrap()
            .proposals
            .get(&id)
            .cloned()
            .ok_or(RelayerError::ProposalNotFound { proposal_id: id })
    }

    async fn secondary_votes(
        &self,
        id: ProposalId,
        chain_id: u64,
    ) -> RelayerResult<SecondaryVoteCollection> {
        let state = self.state.lock().unwrap();
        Ok(state
            .collections
            .get(&(id, chain_id))
            .cloned()
            .unwrap_or(SecondaryVoteCollection {
                proposal_id: id,
                chain_id,
                yes_votes: U256::zero(),
                no_votes: U256::zero(),
                collected: false,
            }))
    }

    async fn registered_chains(&self) -> RelayerResult<Vec<u64>> {
        Ok(self.registered.clone())
    }

    async fn collect_secondary_votes(
        &self,
        id: ProposalId,
        chain_id: u64,
        yes_votes: U256,
        no_votes: U256,
    ) -> RelayerResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.proposals.contains_key(&id) {
                return Err(RelayerError::ProposalNotFound { proposal_id: id });
            }
            if !self.registered.contains(&chain_id) {
                return Err(revert(self.chain_id, "ChainNotRegistered", vec![uint(chain_id)]));
            }
            if state.collections.get(&(id, chain_id)).map_or(false, |c| c.collected) {
                return Err(revert(
                    self.chain_id,
                    "VotesAlreadyCollected",
                    vec![uint(id), uint(chain_id)],
                ));
            }
            state.collections.insert(
                (id, chain_id),
                SecondaryVoteCollection {
                    proposal_id: id,
                    chain_id,
                    yes_votes,
                    no_votes,
                    collected: true,
                },
            );
        }
        self.record(format!(
            "main.collectSecondaryChainVotes({},{},{},{})",
            id, chain_id, yes_votes, no_votes
        ));
        Ok(())
    }

    async fn finalize_proposal_votes(&self, id: ProposalId) -> RelayerResult<()> {
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let proposal = state
                .proposals
                .get_mut(&id)
                .ok_or(RelayerError::ProposalNotFound { proposal_id: id })?;

            if proposal.vote_tally_finalized {
                return Err(revert(self.chain_id, "VoteTallyAlreadyFinalized", vec![uint(id)]));
            }
            if state.now < proposal.end_time {
                return Err(revert(self.chain_id, "VotingPeriodNotEnded", vec![uint(id)]));
            }

            let mut yes = proposal.yes_votes;
            let mut no = proposal.no_votes;
            for chain_id in &self.registered {
                match state.collections.get(&(id, *chain_id)) {
                    Some(c) if c.collected => {
                        yes += c.yes_votes;
                        no += c.no_votes;
                    }
                    _ => {
                        return Err(revert(
                            self.chain_id,
                            "SecondaryVotesNotCollected",
                            vec![uint(id), uint(*chain_id)],
                        ))
                    }
                }
            }

            proposal.final_yes_votes = yes;
            proposal.final_no_votes = no;
            proposal.vote_tally_finalized = true;
            proposal.status = if yes > no {
                ProposalStatus::Accepted
            } else {
                ProposalStatus::Rejected
            };
        }
        self.record(format!("main.finalizeProposalVotes({})", id));
        Ok(())
    }

    async fn execute_proposal(&self, id: ProposalId) -> RelayerResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let proposal = state
                .proposals
                .get_mut(&id)
                .ok_or(RelayerError::ProposalNotFound { proposal_id: id })?;

            if proposal.executed {
                return Err(revert(self.chain_id, "ProposalAlreadyExecuted", vec![uint(id)]));
            }
            if !proposal.vote_tally_finalized {
                return Err(revert(self.chain_id, "VoteTallyNotFinalized", vec![uint(id)]));
            }
            if proposal.status != ProposalStatus::Accepted {
                return Err(revert(self.chain_id, "ProposalNotAccepted", vec![uint(id)]));
            }
            proposal.executed = true;
            proposal.status = ProposalStatus::Executed;
        }
        self.record(format!("main.executeProposal({})", id));
        Ok(())
    }
}

#[derive(Default)]
struct SecondaryState {
    now: u64,
    offline: bool,
    mirrors: BTreeMap<ProposalId, SecondaryMirror>,
}

/// Secondary governance module held in memory
pub struct MockSecondary {
    chain_id: u64,
    state: Mutex<SecondaryState>,
    log: CallLog,
}

impl MockSecondary {
    pub fn new(chain_id: u64, log: CallLog) -> Self {
        Self {
            chain_id,
            state: Mutex::new(SecondaryState::default()),
            log,
        }
    }

    pub fn set_votes(&self, id: ProposalId, yes: u64, no: u64) {
        if let Some(m) = self.state.lock().unwrap().mirrors.get_mut(&id) {
            m.yes_votes = U256::from(yes);
            m.no_votes = U256::from(no);
        }
    }

    pub fn set_time(&self, now: u64) {
        self.state.lock().unwrap().now = now;
    }

    /// Reads and writes fail as if the RPC endpoint were down
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn force_status(&self, id: ProposalId, status: ProposalStatus) {
        if let Some(m) = self.state.lock().unwrap().mirrors.get_mut(&id) {
            m.status = status;
        }
    }

    /// Create a mirror without going through the write log
    pub fn insert_mirror(&self, proposal: &MainProposal) {
        let mirror = new_mirror(&MirrorRequest::from(proposal));
        self.state.lock().unwrap().mirrors.insert(proposal.id, mirror);
    }

    pub fn mirror(&self, id: ProposalId) -> Option<SecondaryMirror> {
        self.state.lock().unwrap().mirrors.get(&id).cloned()
    }

    pub fn mirror_count(&self) -> usize {
        self.state.lock().unwrap().mirrors.len()
    }

    fn online(&self) -> RelayerResult<std::sync::MutexGuard<'_, SecondaryState>> {
        let state = self.state.lock().unwrap();
        if state.offline {
            return Err(RelayerError::ChainUnavailable {
                chain_id: self.chain_id,
            });
        }
        Ok(state)
    }

    fn record(&self, call: String) {
        self.log.lock().unwrap().push(call);
    }
}

fn new_mirror(request: &MirrorRequest) -> SecondaryMirror {
    SecondaryMirror {
        id: request.id,
        title: request.title.clone(),
        content_hash: request.content_hash,
        proposer: request.proposer,
        start_time: request.start_time,
        end_time: request.end_time,
        yes_votes: U256::zero(),
        no_votes: U256::zero(),
        status: ProposalStatus::Pending,
        vote_finalized: false,
    }
}

#[async_trait]
impl SecondaryGovernance for MockSecondary {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn latest_timestamp(&self) -> RelayerResult<u64> {
        Ok(self.online()?.now)
    }

    async fn proposal(&self, id: ProposalId) -> RelayerResult<Option<SecondaryMirror>> {
        Ok(self.online()?.mirrors.get(&id).cloned())
    }

    async fn mirror_proposal(&self, request: &MirrorRequest) -> RelayerResult<()> {
        {
            let mut state = self.online()?;
            if state.mirrors.contains_key(&request.id) {
                return Err(revert(
                    self.chain_id,
                    "ProposalAlreadyMirrored",
                    vec![uint(request.id)],
                ));
            }
            state.mirrors.insert(request.id, new_mirror(request));
        }
        self.record(format!("{}.mirrorProposal({})", self.chain_id, request.id));
        Ok(())
    }

    async fn finalize_votes(&self, id: ProposalId) -> RelayerResult<()> {
        {
            let mut guard = self.online()?;
            let state = &mut *guard;
            let mirror = state
                .mirrors
                .get_mut(&id)
                .ok_or_else(|| revert(self.chain_id, "ProposalNotFound", vec![uint(id)]))?;
            if mirror.vote_finalized {
                return Err(revert(self.chain_id, "VotesAlreadyFinalized", vec![uint(id)]));
            }
            if state.now < mirror.end_time {
                return Err(revert(self.chain_id, "VotingPeriodNotEnded", vec![uint(id)]));
            }
            mirror.vote_finalized = true;
        }
        self.record(format!("{}.finalizeVotes({})", self.chain_id, id));
        Ok(())
    }

    async fn update_proposal_status(
        &self,
        id: ProposalId,
        status: ProposalStatus,
    ) -> RelayerResult<()> {
        {
            let mut state = self.online()?;
            let mirror = state
                .mirrors
                .get_mut(&id)
                .ok_or_else(|| revert(self.chain_id, "ProposalNotFound", vec![uint(id)]))?;
            if mirror.status == status {
                return Err(revert(
                    self.chain_id,
                    "StatusAlreadySet",
                    vec![uint(id), Token::Uint(U256::from(status.as_u8()))],
                ));
            }
            mirror.status = status;
        }
        self.record(format!(
            "{}.updateProposalStatus({},{:?})",
            self.chain_id, id, status
        ));
        Ok(())
    }
}

/// One main ledger, several secondaries, and a workflow wired over them
pub struct Ledgers {
    _dir: TempDir,
    pub main: Arc<MockMain>,
    secondaries: BTreeMap<u64, Arc<MockSecondary>>,
    pub workflow: Arc<FinalizationWorkflow>,
}

impl Ledgers {
    /// Main on chain 1 with `chains` registered. The cache file starts
    /// missing, so the cache asks for a rebuild.
    pub async fn new(chains: &[u64]) -> Self {
        Self::with_clients(chains, chains).await
    }

    /// Main registers `registered`; the relayer only holds clients for
    /// `configured`
    pub async fn with_clients(registered: &[u64], configured: &[u64]) -> Self {
        let dir = TempDir::new().unwrap();
        let main = Arc::new(MockMain::new(1, registered.to_vec()));
        let secondaries: BTreeMap<u64, Arc<MockSecondary>> = configured
            .iter()
            .map(|id| (*id, Arc::new(MockSecondary::new(*id, main.log()))))
            .collect();

        let cache = Arc::new(IdempotencyCache::open(dir.path().join("state.json")).await);
        let workflow = Arc::new(FinalizationWorkflow::new(
            main.clone() as Arc<dyn MainGovernance>,
            secondaries
                .values()
                .map(|s| s.clone() as Arc<dyn SecondaryGovernance>)
                .collect(),
            cache,
        ));

        Self {
            _dir: dir,
            main,
            secondaries,
            workflow,
        }
    }

    pub fn secondary(&self, chain_id: u64) -> Arc<MockSecondary> {
        self.secondaries[&chain_id].clone()
    }

    /// Mirror a main proposal on every secondary, bypassing the write log
    pub fn mirror_all(&self, id: ProposalId) {
        let proposal = self.main.proposal_snapshot(id);
        for secondary in self.secondaries.values() {
            secondary.insert_mirror(&proposal);
        }
    }

    pub fn set_time(&self, now: u64) {
        self.main.set_time(now);
        for secondary in self.secondaries.values() {
            secondary.set_time(now);
        }
    }

    pub fn writes(&self) -> Vec<String> {
        self.main.log.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.main.log.lock().unwrap().clear();
    }
}
