use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::{
    config::EngineConfig,
    core::{
        cache::ResourceCache,
        executor::{MutationExecutor, Settlement},
    },
    entity::{Entity, FieldPatch},
    error::{EngineError, GatewayError},
    gateway::{EventScope, FetchQuery, Filter, RemoteStore, StreamItem, SubscriptionGuard},
    op::{MutationKind, PendingMutation, RemoteWrite, Target},
    realtime::reconciler::{ConnectionState, MergeOutcome, Reconciler},
    schema::ResourceSchema,
    types::{EntityId, Generation, MutationSeq, ResourceName, Row},
};

use super::events::{Notice, ResourceEvent, ResourceView};

/// Cloneable front end of one resource runtime.
///
/// Mutations are applied optimistically before the call's future resolves
/// remotely: the new state is visible through [`Self::watch`] as soon as the
/// runtime has processed the command. The returned future resolves once the
/// remote outcome is known.
#[derive(Clone)]
pub struct ResourceHandle {
    resource: ResourceName,
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<ResourceEvent>,
    view_rx: watch::Receiver<ResourceView>,
}

enum Command {
    Load {
        filters: Vec<Filter>,
        resp: oneshot::Sender<Result<usize, EngineError>>,
    },
    Create {
        payload: Row,
        resp: oneshot::Sender<Result<Entity, EngineError>>,
    },
    Update {
        id: EntityId,
        patch: FieldPatch,
        resp: oneshot::Sender<Result<Entity, EngineError>>,
    },
    Toggle {
        id: EntityId,
        field: String,
        resp: oneshot::Sender<Result<bool, EngineError>>,
    },
    Delete {
        id: EntityId,
        resp: oneshot::Sender<Result<(), EngineError>>,
    },
    Reorder {
        order: Vec<EntityId>,
        resp: oneshot::Sender<Result<(), EngineError>>,
    },
    Track {
        scope: Option<EventScope>,
        resp: oneshot::Sender<()>,
    },
    Snapshot {
        resp: oneshot::Sender<Vec<Entity>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Completions reported by spawned remote calls.
enum Internal {
    Loaded {
        token: u64,
        outcome: Result<Vec<Row>, GatewayError>,
    },
    Settle {
        seq: MutationSeq,
        outcome: Result<Vec<Option<Row>>, GatewayError>,
    },
    Subscribed {
        generation: Generation,
        guard: SubscriptionGuard,
        events: mpsc::UnboundedReceiver<StreamItem>,
    },
    SubscribeFailed {
        generation: Generation,
        error: GatewayError,
    },
    Push {
        generation: Generation,
        item: StreamItem,
    },
    StreamEnded {
        generation: Generation,
    },
}

enum Reply {
    Entity {
        preview: Option<Entity>,
        resp: oneshot::Sender<Result<Entity, EngineError>>,
    },
    Flag {
        value: bool,
        resp: oneshot::Sender<Result<bool, EngineError>>,
    },
    Unit(oneshot::Sender<Result<(), EngineError>>),
}

impl Reply {
    fn fail(self, err: EngineError) {
        match self {
            Self::Entity { resp, .. } => {
                let _ = resp.send(Err(err));
            }
            Self::Flag { resp, .. } => {
                let _ = resp.send(Err(err));
            }
            Self::Unit(resp) => {
                let _ = resp.send(Err(err));
            }
        }
    }
}

struct Waiter {
    target: Option<EntityId>,
    reply: Reply,
}

/// Spawns the single-writer task for `schema` and returns its handle.
///
/// Must be called from within a tokio runtime. The task stops on
/// [`ResourceHandle::shutdown`] or when every handle is dropped; its
/// subscription is released either way.
pub fn spawn_resource(
    gateway: Arc<dyn RemoteStore>,
    schema: ResourceSchema,
    config: &EngineConfig,
) -> ResourceHandle {
    let schema = Arc::new(schema);
    let resource = schema.name.clone();
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound);
    let (events_tx, _) = broadcast::channel::<ResourceEvent>(config.event_buffer);
    let (view_tx, view_rx) = watch::channel(ResourceView::empty(&resource));
    let (internal_tx, internal_rx) = mpsc::unbounded_channel::<Internal>();

    let actor = ResourceActor {
        cache: ResourceCache::new(schema.order_by.clone()),
        executor: MutationExecutor::new(Arc::clone(&schema)),
        reconciler: Reconciler::new(Arc::clone(&schema)),
        schema,
        gateway,
        waiters: HashMap::new(),
        pending_load: None,
        load_token: 0,
        load_error: None,
        last_notice: None,
        internal_tx,
        events_tx: events_tx.clone(),
        view_tx,
    };
    info!(resource = %resource, "resource runtime started");
    tokio::spawn(actor.run(cmd_rx, internal_rx));

    ResourceHandle {
        resource,
        cmd_tx,
        events_tx,
        view_rx,
    }
}

impl ResourceHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Latest published view.
    pub fn state(&self) -> ResourceView {
        self.view_rx.borrow().clone()
    }

    /// View updates.
    pub fn watch(&self) -> watch::Receiver<ResourceView> {
        self.view_rx.clone()
    }

    /// Domain events.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events_tx.subscribe()
    }

    /// Replaces the cache with the full resource; returns the entity count.
    pub async fn load(&self) -> Result<usize, EngineError> {
        self.load_where(Vec::new()).await
    }

    /// Replaces the cache with the rows matching every filter.
    pub async fn load_where(&self, filters: Vec<Filter>) -> Result<usize, EngineError> {
        self.request(|resp| Command::Load { filters, resp }).await?
    }

    /// Creates an entity; resolves to it under its server id.
    pub async fn create(&self, payload: Row) -> Result<Entity, EngineError> {
        self.request(|resp| Command::Create { payload, resp }).await?
    }

    pub async fn update(&self, id: EntityId, patch: FieldPatch) -> Result<Entity, EngineError> {
        self.request(|resp| Command::Update { id, patch, resp }).await?
    }

    /// Flips a boolean field; resolves to the value written.
    pub async fn toggle(&self, id: EntityId, field: &str) -> Result<bool, EngineError> {
        let field = field.to_string();
        self.request(|resp| Command::Toggle { id, field, resp }).await?
    }

    pub async fn delete(&self, id: EntityId) -> Result<(), EngineError> {
        self.request(|resp| Command::Delete { id, resp }).await?
    }

    /// Moves entities into `order`, which must list every cached id once.
    pub async fn reorder(&self, order: Vec<EntityId>) -> Result<(), EngineError> {
        self.request(|resp| Command::Reorder { order, resp }).await?
    }

    /// Follows pushed changes within `scope`, replacing any previous scope.
    pub async fn track(&self, scope: EventScope) -> Result<(), EngineError> {
        self.request(|resp| Command::Track {
            scope: Some(scope),
            resp,
        })
        .await
    }

    /// Stops following pushed changes.
    pub async fn untrack(&self) -> Result<(), EngineError> {
        self.request(|resp| Command::Track { scope: None, resp }).await
    }

    /// Cache contents as of the runtime processing this call.
    pub async fn snapshot(&self) -> Result<Vec<Entity>, EngineError> {
        self.request(|resp| Command::Snapshot { resp }).await
    }

    /// Stops the runtime; completions arriving afterwards are discarded.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|resp| Command::Shutdown { resp }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

struct ResourceActor {
    gateway: Arc<dyn RemoteStore>,
    schema: Arc<ResourceSchema>,
    cache: ResourceCache,
    executor: MutationExecutor,
    reconciler: Reconciler,
    waiters: HashMap<MutationSeq, Waiter>,
    pending_load: Option<(u64, oneshot::Sender<Result<usize, EngineError>>)>,
    load_token: u64,
    load_error: Option<EngineError>,
    last_notice: Option<Notice>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events_tx: broadcast::Sender<ResourceEvent>,
    view_tx: watch::Sender<ResourceView>,
}

impl ResourceActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    let done = self.handle_command(cmd);
                    self.publish();
                    if done {
                        break;
                    }
                }
                Some(msg) = internal_rx.recv() => {
                    self.handle_internal(msg);
                    self.publish();
                }
            }
        }

        self.reconciler.teardown();
        self.publish();
        info!(resource = %self.schema.name, in_flight = self.waiters.len(), "resource runtime stopped");
    }

    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Load { filters, resp } => self.start_load(filters, resp),
            Command::Create { payload, resp } => {
                match self.executor.begin_create(&mut self.cache, payload) {
                    Ok(pending) => {
                        let preview = pending.preview.clone();
                        self.dispatch(pending, Reply::Entity { preview, resp });
                    }
                    Err(err) => self.reject(MutationKind::Create, err, Reply::Entity { preview: None, resp }),
                }
            }
            Command::Update { id, patch, resp } => {
                match self.executor.begin_update(&mut self.cache, &id, patch) {
                    Ok(pending) => {
                        let preview = pending.preview.clone();
                        self.dispatch(pending, Reply::Entity { preview, resp });
                    }
                    Err(err) => self.reject(MutationKind::Update, err, Reply::Entity { preview: None, resp }),
                }
            }
            Command::Toggle { id, field, resp } => {
                match self.executor.begin_toggle(&mut self.cache, &id, &field) {
                    Ok(pending) => {
                        let value = pending
                            .intent
                            .deltas
                            .get(&field)
                            .and_then(serde_json::Value::as_bool)
                            .unwrap_or(false);
                        self.dispatch(pending, Reply::Flag { value, resp });
                    }
                    Err(err) => self.reject(MutationKind::Toggle, err, Reply::Flag { value: false, resp }),
                }
            }
            Command::Delete { id, resp } => match self.executor.begin_delete(&mut self.cache, &id) {
                Ok(pending) => self.dispatch(pending, Reply::Unit(resp)),
                Err(err) => self.reject(MutationKind::Delete, err, Reply::Unit(resp)),
            },
            Command::Reorder { order, resp } => {
                match self.executor.begin_reorder(&mut self.cache, &order) {
                    Ok(pending) => self.dispatch(pending, Reply::Unit(resp)),
                    Err(err) => self.reject(MutationKind::Reorder, err, Reply::Unit(resp)),
                }
            }
            Command::Track { scope, resp } => {
                self.retarget(scope);
                let _ = resp.send(());
            }
            Command::Snapshot { resp } => {
                let _ = resp.send(self.cache.snapshot());
            }
            Command::Shutdown { resp } => {
                self.reconciler.teardown();
                let _ = resp.send(());
                return true;
            }
        }
        false
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Loaded { token, outcome } => self.finish_load(token, outcome),
            Internal::Settle { seq, outcome } => self.settle(seq, outcome),
            Internal::Subscribed {
                generation,
                guard,
                events,
            } => {
                if self.reconciler.attach(generation, guard) {
                    self.forward(generation, events);
                    self.emit(ResourceEvent::ConnectionChanged {
                        state: ConnectionState::Connected,
                    });
                }
            }
            Internal::SubscribeFailed { generation, error } => self.link_failed(generation, error),
            Internal::Push { generation, item } => {
                if generation != self.reconciler.generation() {
                    trace!(resource = %self.schema.name, generation, "push from stale subscription dropped");
                    return;
                }
                match item {
                    Ok(event) => {
                        let outcome = self.reconciler.merge(&mut self.cache, &mut self.executor, &event);
                        match outcome {
                            MergeOutcome::Inserted(id) | MergeOutcome::Updated(id) | MergeOutcome::Deleted(id) => {
                                debug!(resource = %self.schema.name, id = %id, kind = ?event.kind, "push merged");
                                self.emit(ResourceEvent::Pushed { id, kind: event.kind });
                            }
                            MergeOutcome::Ignored => {}
                        }
                    }
                    Err(err) => self.link_failed(generation, err),
                }
            }
            Internal::StreamEnded { generation } => {
                if generation == self.reconciler.generation()
                    && self.reconciler.state() == ConnectionState::Connected
                {
                    self.link_failed(generation, GatewayError::Closed);
                }
            }
        }
    }

    fn start_load(&mut self, filters: Vec<Filter>, resp: oneshot::Sender<Result<usize, EngineError>>) {
        if let Some((_, previous)) = self.pending_load.take() {
            let _ = previous.send(Err(EngineError::Superseded));
        }
        self.load_token += 1;
        let token = self.load_token;
        self.pending_load = Some((token, resp));

        let mut query = FetchQuery::new(&self.schema.name).order(self.schema.order_by.clone());
        query.filters = filters;
        let gateway = Arc::clone(&self.gateway);
        let tx = self.internal_tx.clone();
        debug!(resource = %self.schema.name, token, "load requested");
        tokio::spawn(async move {
            let outcome = gateway.fetch(&query).await;
            let _ = tx.send(Internal::Loaded { token, outcome });
        });
    }

    fn finish_load(&mut self, token: u64, outcome: Result<Vec<Row>, GatewayError>) {
        let resp = match self.pending_load.take() {
            Some((current, resp)) if current == token => resp,
            other => {
                self.pending_load = other;
                debug!(resource = %self.schema.name, token, "stale load result dropped");
                return;
            }
        };

        match outcome {
            Ok(rows) => {
                let mut entities = Vec::with_capacity(rows.len());
                for row in &rows {
                    match self.schema.ingest(row) {
                        Ok(entity) => entities.push(entity),
                        Err(err) => warn!(resource = %self.schema.name, error = %err, "malformed row skipped"),
                    }
                }
                let count = entities.len();
                self.cache.load(entities);
                self.load_error = None;
                info!(resource = %self.schema.name, count, epoch = self.cache.epoch(), "resource loaded");
                self.emit(ResourceEvent::Loaded { count });
                let _ = resp.send(Ok(count));
            }
            Err(err) => {
                let err = EngineError::from(err);
                warn!(resource = %self.schema.name, error = %err, "load failed");
                self.load_error = Some(err.clone());
                self.notify(Notice::error(format!("could not load {}: {err}", self.schema.name)));
                let _ = resp.send(Err(err));
            }
        }
    }

    fn dispatch(&mut self, pending: PendingMutation, reply: Reply) {
        let PendingMutation {
            seq,
            intent,
            writes,
            ..
        } = pending;
        let target = match intent.target {
            Target::Entity(id) => Some(id),
            Target::New | Target::All => None,
        };
        self.waiters.insert(seq, Waiter { target, reply });

        let gateway = Arc::clone(&self.gateway);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let outcome = run_writes(gateway.as_ref(), &writes).await;
            let _ = tx.send(Internal::Settle { seq, outcome });
        });
    }

    fn reject(&mut self, kind: MutationKind, err: EngineError, reply: Reply) {
        debug!(resource = %self.schema.name, ?kind, error = %err, "mutation rejected");
        self.notify(Notice::error(failure_message(kind, &self.schema.name, &err)));
        reply.fail(err);
    }

    fn settle(&mut self, seq: MutationSeq, outcome: Result<Vec<Option<Row>>, GatewayError>) {
        let settlement = self.executor.settle(&mut self.cache, seq, outcome);
        let waiter = self.waiters.remove(&seq);

        match settlement {
            Settlement::Committed { kind, entity, .. } => {
                let target = waiter.as_ref().and_then(|w| w.target.clone());
                let event = match kind {
                    MutationKind::Create => entity.as_ref().map(|e| ResourceEvent::Created { id: e.id.clone() }),
                    MutationKind::Update | MutationKind::Toggle => {
                        target.map(|id| ResourceEvent::Updated { id })
                    }
                    MutationKind::Delete => target.map(|id| ResourceEvent::Deleted { id }),
                    MutationKind::Reorder => Some(ResourceEvent::Reordered),
                };
                if let Some(event) = event {
                    self.emit(event);
                }
                self.notify(Notice::success(format!("{} {}", self.schema.name, past_tense(kind))));

                let Some(waiter) = waiter else { return };
                match waiter.reply {
                    Reply::Entity { preview, resp } => {
                        let _ = resp.send(entity.or(preview).ok_or(EngineError::Superseded));
                    }
                    Reply::Flag { value, resp } => {
                        let _ = resp.send(Ok(value));
                    }
                    Reply::Unit(resp) => {
                        let _ = resp.send(Ok(()));
                    }
                }
            }
            Settlement::RolledBack { seq, kind, error } => {
                self.notify(Notice::error(failure_message(kind, &self.schema.name, &error)));
                self.emit(ResourceEvent::RolledBack {
                    seq,
                    kind,
                    error: error.clone(),
                });
                if let Some(waiter) = waiter {
                    waiter.reply.fail(error);
                }
            }
            Settlement::Unknown { seq } => {
                warn!(resource = %self.schema.name, seq, "settlement for unknown mutation");
            }
        }
    }

    fn retarget(&mut self, scope: Option<EventScope>) {
        let requested = scope.clone();
        let generation = self.reconciler.retarget(scope);
        self.emit(ResourceEvent::ConnectionChanged {
            state: self.reconciler.state(),
        });
        let (Some(generation), Some(scope)) = (generation, requested) else {
            return;
        };

        let gateway = Arc::clone(&self.gateway);
        let resource = self.schema.name.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let msg = match gateway.subscribe(&resource, &scope).await {
                Ok(sub) => Internal::Subscribed {
                    generation,
                    guard: SubscriptionGuard::new(sub.id, Arc::clone(&gateway)),
                    events: sub.events,
                },
                Err(error) => Internal::SubscribeFailed { generation, error },
            };
            // A closed runtime drops the message and with it the guard.
            let _ = tx.send(msg);
        });
    }

    fn forward(&self, generation: Generation, mut events: mpsc::UnboundedReceiver<StreamItem>) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(item) = events.recv().await {
                if tx.send(Internal::Push { generation, item }).is_err() {
                    return;
                }
            }
            let _ = tx.send(Internal::StreamEnded { generation });
        });
    }

    fn link_failed(&mut self, generation: Generation, err: GatewayError) {
        let message = format!("realtime updates for {} stopped: {err}", self.schema.name);
        if self.reconciler.fail(generation, err) {
            self.notify(Notice::error(message));
            self.emit(ResourceEvent::ConnectionChanged {
                state: ConnectionState::Error,
            });
        }
    }

    fn notify(&mut self, notice: Notice) {
        self.last_notice = Some(notice.clone());
        self.emit(ResourceEvent::Notice(notice));
    }

    fn emit(&self, event: ResourceEvent) {
        let _ = self.events_tx.send(event);
    }

    fn publish(&self) {
        self.view_tx.send_replace(ResourceView {
            resource: self.schema.name.clone(),
            entities: self.cache.snapshot(),
            loading: self.pending_load.is_some(),
            saving: self.executor.in_flight_len() > 0,
            error: self.load_error.clone(),
            connection: self.reconciler.state(),
            last_notice: self.last_notice.clone(),
        });
    }
}

/// Issues `writes` in order, stopping at the first failure.
async fn run_writes(
    gateway: &dyn RemoteStore,
    writes: &[RemoteWrite],
) -> Result<Vec<Option<Row>>, GatewayError> {
    let mut rows = Vec::with_capacity(writes.len());
    for write in writes {
        rows.push(gateway.mutate(write).await?);
    }
    Ok(rows)
}

fn past_tense(kind: MutationKind) -> &'static str {
    match kind {
        MutationKind::Create => "created",
        MutationKind::Update | MutationKind::Toggle => "updated",
        MutationKind::Delete => "deleted",
        MutationKind::Reorder => "reordered",
    }
}

fn failure_message(kind: MutationKind, resource: &str, err: &EngineError) -> String {
    let verb = match kind {
        MutationKind::Create => "create",
        MutationKind::Update | MutationKind::Toggle => "update",
        MutationKind::Delete => "delete",
        MutationKind::Reorder => "reorder",
    };
    format!("could not {verb} {resource}: {err}")
}
