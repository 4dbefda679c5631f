//! In-process wiring of a coordinator, three participant elements and the
//! business initiator over memory stores.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use coordinator::{Coordinator, CoordinatorOptions, MemoryTransactionStore};
use core_2pc::{
    retry::RetryPolicy, tm::TransactionManager, BranchId, BranchStatus, DecideResponse, Decision, GlobalId,
    GlobalStatusResponse, ParticipantClient, Row, TransactionCoordinator, TxError,
};
use element::{
    business::{BusinessService, PurchaseParticipants, PurchaseRequest},
    services::{self, CreateOrder, DecreaseBalance, DecreaseStock, ACCOUNT, ORDER, STORAGE},
    ElementError, Enlistment, LocalDatabase, MemoryDatabase, ResourceManager,
};

pub const STORAGE_ENDPOINT: &str = "http://storage.test";
pub const ACCOUNT_ENDPOINT: &str = "http://account.test";
pub const ORDER_ENDPOINT: &str = "http://order.test";

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub endpoint: String,
    pub branch_id: BranchId,
    pub decision: Decision,
    pub status: BranchStatus,
}

/// Routes the coordinator's decisions to resource managers by endpoint.
#[derive(Default)]
pub struct Network {
    managers: Mutex<HashMap<String, Arc<ResourceManager>>>,
    unreachable: Mutex<HashSet<String>>,
    deliveries: Mutex<Vec<Delivery>>,
}

impl Network {
    pub fn attach(&self, manager: Arc<ResourceManager>) {
        let endpoint = manager.enlistment().endpoint.clone();
        self.managers.lock().unwrap().insert(endpoint, manager);
    }

    pub fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if unreachable {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    /// Decisions that reached a participant, in arrival order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn deliveries_to(&self, endpoint: &str) -> Vec<Delivery> {
        self.deliveries().into_iter().filter(|d| d.endpoint == endpoint).collect()
    }
}

#[async_trait]
impl ParticipantClient for Network {
    async fn decide(&self, endpoint: &str, branch_id: BranchId, decision: Decision) -> Result<DecideResponse, TxError> {
        let unreachable = |reason: &str| TxError::ParticipantUnreachable {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        };
        if self.unreachable.lock().unwrap().contains(endpoint) {
            return Err(unreachable("network partition"));
        }
        let manager = self
            .managers
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| unreachable("no such host"))?;

        let response = manager
            .on_decision(branch_id, decision)
            .await
            .map_err(|e| unreachable(&e.to_string()))?;
        self.deliveries.lock().unwrap().push(Delivery {
            endpoint: endpoint.to_string(),
            branch_id,
            decision,
            status: response.status,
        });
        Ok(response)
    }
}

/// The business's view of the participants, calling their operations directly.
pub struct LocalParticipants {
    pub storage: Arc<ResourceManager>,
    pub account: Arc<ResourceManager>,
    pub order: Arc<ResourceManager>,
    /// Extra latency before the order is created.
    pub order_delay: Duration,
}

#[async_trait]
impl PurchaseParticipants for LocalParticipants {
    async fn decrease_stock(&self, global_id: GlobalId, request: DecreaseStock) -> Result<(), ElementError> {
        services::decrease_stock(&self.storage, global_id, request).await
    }

    async fn decrease_balance(&self, global_id: GlobalId, request: DecreaseBalance) -> Result<(), ElementError> {
        services::decrease_balance(&self.account, global_id, request).await
    }

    async fn create_order(&self, global_id: GlobalId, request: CreateOrder) -> Result<(), ElementError> {
        tokio::time::sleep(self.order_delay).await;
        services::create_order(&self.order, global_id, request).await.map(|_| ())
    }
}

pub fn options(phase_two_wait: Duration) -> CoordinatorOptions {
    CoordinatorOptions {
        default_timeout: Duration::from_secs(60),
        retry: RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
        phase_two_wait,
        sweep_interval: Duration::from_millis(20),
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20)).with_max_attempts(3)
}

pub struct Harness {
    pub store: MemoryTransactionStore,
    pub network: Arc<Network>,
    pub coordinator: Coordinator,
    pub storage: Arc<ResourceManager>,
    pub account: Arc<ResourceManager>,
    pub order: Arc<ResourceManager>,
    pub storage_db: MemoryDatabase,
    pub account_db: MemoryDatabase,
    pub order_db: MemoryDatabase,
    pub business: BusinessService,
}

pub struct HarnessConfig {
    pub phase_two_wait: Duration,
    pub purchase_timeout: Duration,
    pub order_delay: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            phase_two_wait: Duration::from_secs(2),
            purchase_timeout: Duration::from_secs(5),
            order_delay: Duration::ZERO,
        }
    }
}

/// Product 1 with 100 units, user 1 with a balance of 1000.
pub fn stock_row(used: i64, residue: i64) -> Row {
    Row::new()
        .with("product_id", 1)
        .with("total", 100)
        .with("used", used)
        .with("residue", residue)
}

pub fn balance_row(used: i64, residue: i64) -> Row {
    Row::new()
        .with("user_id", 1)
        .with("total", 1_000)
        .with("used", used)
        .with("residue", residue)
}

fn manager(
    participant: &str,
    endpoint: &str,
    coordinator: &Arc<dyn TransactionCoordinator>,
    database: &MemoryDatabase,
) -> Arc<ResourceManager> {
    let enlistment = Enlistment {
        participant: participant.to_string(),
        resource: participant.to_string(),
        endpoint: endpoint.to_string(),
    };
    let manager = ResourceManager::new(enlistment, coordinator.clone(), Arc::new(database.clone()))
        .with_retry(fast_retry())
        .with_lock_retry(RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20)).with_max_attempts(200));
    Arc::new(manager)
}

impl Harness {
    pub async fn start(config: HarnessConfig) -> Self {
        let store = MemoryTransactionStore::new();
        let network = Arc::new(Network::default());
        let coordinator = Coordinator::new(Arc::new(store.clone()), network.clone(), options(config.phase_two_wait));
        let tc: Arc<dyn TransactionCoordinator> = Arc::new(coordinator.clone());

        let storage_db = MemoryDatabase::new(&[STORAGE]);
        let account_db = MemoryDatabase::new(&[ACCOUNT]);
        let order_db = MemoryDatabase::new(&[ORDER]);
        storage_db.seed(&STORAGE, stock_row(0, 100)).await.unwrap();
        account_db.seed(&ACCOUNT, balance_row(0, 1_000)).await.unwrap();

        let storage = manager("storage", STORAGE_ENDPOINT, &tc, &storage_db);
        let account = manager("account", ACCOUNT_ENDPOINT, &tc, &account_db);
        let order = manager("order", ORDER_ENDPOINT, &tc, &order_db);
        for m in [&storage, &account, &order] {
            network.attach(m.clone());
        }

        let participants = LocalParticipants {
            storage: storage.clone(),
            account: account.clone(),
            order: order.clone(),
            order_delay: config.order_delay,
        };
        let tm = TransactionManager::new(tc, "business").with_retry(fast_retry());
        let business = BusinessService::new(tm, Arc::new(participants), config.purchase_timeout);

        Self {
            store,
            network,
            coordinator,
            storage,
            account,
            order,
            storage_db,
            account_db,
            order_db,
            business,
        }
    }

    /// Stop the current coordinator and bring up a new one over the same store.
    pub async fn restart_coordinator(&self) -> Coordinator {
        self.coordinator.shutdown();
        Coordinator::recover(Arc::new(self.store.clone()), self.network.clone(), options(Duration::from_secs(2)))
            .await
            .unwrap()
    }

    pub async fn stock(&self) -> Option<Row> {
        self.storage_db.read(&STORAGE, 1).await.unwrap()
    }

    pub async fn balance(&self) -> Option<Row> {
        self.account_db.read(&ACCOUNT, 1).await.unwrap()
    }
}

pub fn purchase(count: i64, money: i64) -> PurchaseRequest {
    PurchaseRequest {
        user_id: 1,
        product_id: 1,
        count,
        money,
    }
}

pub async fn wait_finished(coordinator: &Coordinator, global_id: GlobalId) -> GlobalStatusResponse {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = coordinator.query(global_id).await.unwrap();
            if status.is_finished() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("global transaction did not finish")
}
