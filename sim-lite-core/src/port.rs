use crate::error::{SimError, SimResult};
use crate::observe::Listeners;
use crate::types::ListenerId;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use tracing::trace;
use uuid::Uuid;

/// The flow direction (or a domain-specific custom channel) a port
/// belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortChannel {
    Input,
    Output,
    Custom(String),
}

/// Item conveyed through ports. Identity-compared, type-erased.
pub type PortItem = Rc<dyn Any>;

/// Optional discriminator handed to take/peek handlers.
pub type PortSelector = Option<Rc<dyn Any>>;

#[derive(Clone, Debug)]
pub enum PortEvent {
    DataAccepted { port: Uuid },
    DataRejected { port: Uuid },
    DataAvailable { port: Uuid },
}

#[derive(Clone, Debug)]
pub enum PortSetEvent {
    PortAdded(Uuid),
    PortRemoved(Uuid),
}

/// Shared identity and bookkeeping carried by both port variants.
#[derive(Clone, Debug)]
pub struct PortMeta {
    pub owner: Uuid,
    pub name: String,
    pub guid: Uuid,
    pub index: u32,
    pub channel: PortChannel,
    /// Out-of-band data: string-keyed annotations used for sorting and
    /// owner-specific bookkeeping.
    pub oob: BTreeMap<String, String>,
    /// Intrinsic ports belong to the owner's fixed shape and are not
    /// removed by reconfiguration.
    pub intrinsic: bool,
}

impl PortMeta {
    pub fn new(owner: Uuid, name: &str, index: u32, channel: PortChannel) -> Self {
        Self {
            owner,
            name: name.to_string(),
            guid: Uuid::new_v4(),
            index,
            channel,
            oob: BTreeMap::new(),
            intrinsic: false,
        }
    }
}

// ─── Input ────────────────────────────────────────────────────

type PutHandler = Rc<dyn Fn(&PortItem) -> bool>;

struct InPortInner {
    meta: PortMeta,
    put_handler: Option<PutHandler>,
    connected: Cell<bool>,
}

/// Receiving attachment point. `put` consults the owner's put handler;
/// without one the item is rejected (nothing would consume it).
#[derive(Clone)]
pub struct InputPort {
    inner: Rc<InPortInner>,
    listeners: Rc<Listeners<PortEvent>>,
}

impl std::fmt::Debug for InputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPort")
            .field("meta", &self.inner.meta)
            .finish()
    }
}

impl InputPort {
    pub fn new(meta: PortMeta) -> Self {
        Self {
            inner: Rc::new(InPortInner {
                meta,
                put_handler: None,
                connected: Cell::new(false),
            }),
            listeners: Rc::new(Listeners::new()),
        }
    }

    pub fn with_put_handler(meta: PortMeta, handler: PutHandler) -> Self {
        Self {
            inner: Rc::new(InPortInner {
                meta,
                put_handler: Some(handler),
                connected: Cell::new(false),
            }),
            listeners: Rc::new(Listeners::new()),
        }
    }

    pub fn meta(&self) -> &PortMeta {
        &self.inner.meta
    }

    pub fn guid(&self) -> Uuid {
        self.inner.meta.guid
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.get()
    }

    pub fn on_event<F: Fn(&PortEvent) + 'static>(&self, f: F) -> ListenerId {
        self.listeners.subscribe_fn(f)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Offer an item. Returns the handler's verdict and fires
    /// `DataAccepted` / `DataRejected` accordingly.
    pub fn put(&self, item: PortItem) -> bool {
        let accepted = match &self.inner.put_handler {
            Some(handler) => handler(&item),
            None => false,
        };
        let guid = self.guid();
        trace!(target: "sim_lite::port", port = %guid, accepted, "put");
        self.listeners.emit(&if accepted {
            PortEvent::DataAccepted { port: guid }
        } else {
            PortEvent::DataRejected { port: guid }
        });
        accepted
    }

    /// Upstream signal that a pull opportunity exists.
    pub fn notify_data_available(&self) {
        self.listeners
            .emit(&PortEvent::DataAvailable { port: self.guid() });
    }
}

// ─── Output ───────────────────────────────────────────────────

type TakeHandler = Rc<dyn Fn(&OutputPort, &PortSelector) -> Option<PortItem>>;

struct OutPortInner {
    meta: PortMeta,
    take_handler: RefCell<Option<TakeHandler>>,
    peek_handler: RefCell<Option<TakeHandler>>,
    connected: Cell<bool>,
}

/// Producing attachment point with consumptive `take` and
/// non-consumptive `peek`.
#[derive(Clone)]
pub struct OutputPort {
    inner: Rc<OutPortInner>,
    listeners: Rc<Listeners<PortEvent>>,
}

impl std::fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPort")
            .field("meta", &self.inner.meta)
            .finish()
    }
}

impl OutputPort {
    pub fn new(meta: PortMeta) -> Self {
        Self {
            inner: Rc::new(OutPortInner {
                meta,
                take_handler: RefCell::new(None),
                peek_handler: RefCell::new(None),
                connected: Cell::new(false),
            }),
            listeners: Rc::new(Listeners::new()),
        }
    }

    pub fn meta(&self) -> &PortMeta {
        &self.inner.meta
    }

    pub fn guid(&self) -> Uuid {
        self.inner.meta.guid
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.get()
    }

    pub fn set_take_handler(&self, handler: TakeHandler) {
        *self.inner.take_handler.borrow_mut() = Some(handler);
    }

    pub fn set_peek_handler(&self, handler: TakeHandler) {
        *self.inner.peek_handler.borrow_mut() = Some(handler);
    }

    pub fn on_event<F: Fn(&PortEvent) + 'static>(&self, f: F) -> ListenerId {
        self.listeners.subscribe_fn(f)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Consumptive take. Fires accepted/rejected like `put` does.
    pub fn take(&self, selector: &PortSelector) -> Option<PortItem> {
        let handler = self.inner.take_handler.borrow().clone();
        let item = handler.and_then(|h| h(self, selector));
        let guid = self.guid();
        trace!(target: "sim_lite::port", port = %guid, got = item.is_some(), "take");
        self.listeners.emit(&if item.is_some() {
            PortEvent::DataAccepted { port: guid }
        } else {
            PortEvent::DataRejected { port: guid }
        });
        item
    }

    /// Non-consumptive read; None when no peek handler is installed.
    pub fn peek(&self, selector: &PortSelector) -> Option<PortItem> {
        let handler = self.inner.peek_handler.borrow().clone();
        handler.and_then(|h| h(self, selector))
    }
}

// ─── Capability view ──────────────────────────────────────────

/// A port regardless of direction — the view [`PortSet`] stores.
#[derive(Clone)]
pub enum PortRef {
    Input(InputPort),
    Output(OutputPort),
}

impl PortRef {
    pub fn meta(&self) -> &PortMeta {
        match self {
            PortRef::Input(p) => p.meta(),
            PortRef::Output(p) => p.meta(),
        }
    }

    pub fn guid(&self) -> Uuid {
        self.meta().guid
    }

    pub fn index(&self) -> u32 {
        self.meta().index
    }

    pub fn on_event(&self, f: Rc<dyn Fn(&PortEvent)>) -> ListenerId {
        match self {
            PortRef::Input(p) => p.listeners.subscribe(f),
            PortRef::Output(p) => p.listeners.subscribe(f),
        }
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        match self {
            PortRef::Input(p) => p.remove_listener(id),
            PortRef::Output(p) => p.remove_listener(id),
        }
    }
}

// ─── Connector ────────────────────────────────────────────────

/// A directed link between exactly one output port and one input port,
/// optionally buffering items the input rejects.
#[derive(Debug)]
pub struct Connector {
    guid: Uuid,
    output: OutputPort,
    input: InputPort,
    buffer: Option<RefCell<Vec<PortItem>>>,
}

impl Connector {
    /// Fails with a structural error when either port is already wired.
    pub fn connect(output: &OutputPort, input: &InputPort, buffered: bool) -> SimResult<Self> {
        if output.is_connected() {
            return Err(SimError::Structural {
                reason: format!("output port '{}' is already connected", output.meta().name),
            });
        }
        if input.is_connected() {
            return Err(SimError::Structural {
                reason: format!("input port '{}' is already connected", input.meta().name),
            });
        }
        output.inner.connected.set(true);
        input.inner.connected.set(true);
        Ok(Self {
            guid: Uuid::new_v4(),
            output: output.clone(),
            input: input.clone(),
            buffer: buffered.then(|| RefCell::new(Vec::new())),
        })
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn output(&self) -> &OutputPort {
        &self.output
    }

    pub fn input(&self) -> &InputPort {
        &self.input
    }

    /// Push an item across. A buffered connector parks rejected items
    /// for a later `flush`.
    pub fn convey(&self, item: PortItem) -> bool {
        if self.input.put(item.clone()) {
            return true;
        }
        if let Some(buffer) = &self.buffer {
            buffer.borrow_mut().push(item);
        }
        false
    }

    /// Re-offer parked items in arrival order; stops at the first
    /// rejection. Returns how many were accepted.
    pub fn flush(&self) -> usize {
        let Some(buffer) = &self.buffer else { return 0 };
        let mut accepted = 0;
        loop {
            let next = {
                let mut pending = buffer.borrow_mut();
                if pending.is_empty() {
                    break;
                }
                pending.remove(0)
            };
            if self.input.put(next.clone()) {
                accepted += 1;
            } else {
                buffer.borrow_mut().insert(0, next);
                break;
            }
        }
        accepted
    }

    /// Pull from the output side and convey the result downstream.
    pub fn pull(&self, selector: &PortSelector) -> bool {
        match self.output.take(selector) {
            Some(item) => self.convey(item),
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.as_ref().map(|b| b.borrow().len()).unwrap_or(0)
    }

    pub fn disconnect(self) {
        self.output.inner.connected.set(false);
        self.input.inner.connected.set(false);
    }
}

// ─── Port set ─────────────────────────────────────────────────

/// Owner-provided factory for `create_port(channel)`.
pub type PortFactory = Rc<dyn Fn(&PortChannel) -> Option<PortRef>>;

struct SetInner {
    ports: BTreeMap<Uuid, PortRef>,
    /// Set-level listeners mirrored onto every member port.
    templates: Vec<(usize, Rc<dyn Fn(&PortEvent)>)>,
    attached: BTreeMap<(Uuid, usize), ListenerId>,
    next_template: usize,
    factory: Option<PortFactory>,
}

/// Guid-keyed container of ports with filtered, ordered views and
/// add/remove events. Listeners attached at set level propagate to and
/// from contained ports on add and remove.
#[derive(Clone)]
pub struct PortSet {
    inner: Rc<RefCell<SetInner>>,
    listeners: Rc<Listeners<PortSetEvent>>,
}

impl Default for PortSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PortSet {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SetInner {
                ports: BTreeMap::new(),
                templates: Vec::new(),
                attached: BTreeMap::new(),
                next_template: 0,
                factory: None,
            })),
            listeners: Rc::new(Listeners::new()),
        }
    }

    pub fn with_factory(self, factory: PortFactory) -> Self {
        self.inner.borrow_mut().factory = Some(factory);
        self
    }

    pub fn on_event<F: Fn(&PortSetEvent) + 'static>(&self, f: F) -> ListenerId {
        self.listeners.subscribe_fn(f)
    }

    /// Attach a listener to every current and future member port.
    pub fn add_port_listener(&self, f: Rc<dyn Fn(&PortEvent)>) -> usize {
        let mut inner = self.inner.borrow_mut();
        let template = inner.next_template;
        inner.next_template += 1;
        inner.templates.push((template, f.clone()));
        let ports: Vec<PortRef> = inner.ports.values().cloned().collect();
        for port in ports {
            let lid = port.on_event(f.clone());
            inner.attached.insert((port.guid(), template), lid);
        }
        template
    }

    pub fn add_port(&self, port: PortRef) -> SimResult<()> {
        let guid = port.guid();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.ports.contains_key(&guid) {
                return Err(SimError::Structural {
                    reason: format!("duplicate port {guid}"),
                });
            }
            let templates = inner.templates.clone();
            for (template, f) in templates {
                let lid = port.on_event(f);
                inner.attached.insert((guid, template), lid);
            }
            inner.ports.insert(guid, port);
        }
        self.listeners.emit(&PortSetEvent::PortAdded(guid));
        Ok(())
    }

    /// Create a port through the owner-provided factory, then add it.
    pub fn create_port(&self, channel: &PortChannel) -> SimResult<PortRef> {
        let factory = self.inner.borrow().factory.clone();
        let port = factory
            .and_then(|f| f(channel))
            .ok_or_else(|| SimError::Structural {
                reason: "owner provides no port factory for this channel".into(),
            })?;
        self.add_port(port.clone())?;
        Ok(port)
    }

    pub fn remove_port(&self, guid: Uuid) -> Option<PortRef> {
        let port = {
            let mut inner = self.inner.borrow_mut();
            let port = inner.ports.remove(&guid)?;
            let doomed: Vec<(Uuid, usize)> = inner
                .attached
                .keys()
                .filter(|(g, _)| *g == guid)
                .copied()
                .collect();
            for key in doomed {
                if let Some(lid) = inner.attached.remove(&key) {
                    port.remove_listener(lid);
                }
            }
            Some(port)
        }?;
        self.listeners.emit(&PortSetEvent::PortRemoved(guid));
        Some(port)
    }

    pub fn get(&self, guid: Uuid) -> Option<PortRef> {
        self.inner.borrow().ports.get(&guid).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().ports.is_empty()
    }

    /// Input ports, ordered by port index.
    pub fn inputs(&self) -> Vec<InputPort> {
        let mut out: Vec<InputPort> = self
            .inner
            .borrow()
            .ports
            .values()
            .filter_map(|p| match p {
                PortRef::Input(p) => Some(p.clone()),
                PortRef::Output(_) => None,
            })
            .collect();
        out.sort_by_key(|p| p.meta().index);
        out
    }

    /// Output ports, ordered by port index.
    pub fn outputs(&self) -> Vec<OutputPort> {
        let mut out: Vec<OutputPort> = self
            .inner
            .borrow()
            .ports
            .values()
            .filter_map(|p| match p {
                PortRef::Output(p) => Some(p.clone()),
                PortRef::Input(_) => None,
            })
            .collect();
        out.sort_by_key(|p| p.meta().index);
        out
    }

    /// All ports ordered by the value of an out-of-band key; ports
    /// lacking the key sort last in index order.
    pub fn sorted_by_oob(&self, key: &str) -> Vec<PortRef> {
        let mut out: Vec<PortRef> = self.inner.borrow().ports.values().cloned().collect();
        out.sort_by(|a, b| {
            let ka = a.meta().oob.get(key);
            let kb = b.meta().oob.get(key);
            match (ka, kb) {
                (Some(x), Some(y)) => x.cmp(y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.index().cmp(&b.index()),
            }
        });
        out
    }
}

// ─── Port managers ────────────────────────────────────────────

/// How long a buffered value outlives its delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferPersistence {
    None,
    UntilRead,
    UntilWrite,
}

/// What a write does to the managed buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteAction {
    Ignore,
    Store,
    StoreAndInvalidate,
    Push,
}

/// Wraps an input port with buffering policy.
pub struct InputPortManager {
    port: InputPort,
    persistence: BufferPersistence,
    write_action: WriteAction,
    buffer: RefCell<Option<PortItem>>,
}

impl InputPortManager {
    pub fn new(port: InputPort, persistence: BufferPersistence, write_action: WriteAction) -> Self {
        Self {
            port,
            persistence,
            write_action,
            buffer: RefCell::new(None),
        }
    }

    pub fn port(&self) -> &InputPort {
        &self.port
    }

    pub fn write(&self, item: PortItem) -> bool {
        match self.write_action {
            WriteAction::Ignore => false,
            WriteAction::Store | WriteAction::StoreAndInvalidate => {
                *self.buffer.borrow_mut() = Some(item);
                true
            }
            WriteAction::Push => self.port.put(item),
        }
    }

    pub fn read(&self) -> Option<PortItem> {
        match self.persistence {
            BufferPersistence::None | BufferPersistence::UntilRead => self.buffer.borrow_mut().take(),
            BufferPersistence::UntilWrite => self.buffer.borrow().clone(),
        }
    }
}

struct OpmInner {
    port: OutputPort,
    write_action: WriteAction,
    compute: RefCell<Option<Rc<dyn Fn() -> Option<PortItem>>>>,
    buffer: RefCell<Option<PortItem>>,
    valid: Cell<bool>,
    peers: RefCell<Vec<Weak<OpmInner>>>,
}

/// Wraps an output port: serves `take` lazily from a compute function,
/// caches the value, and invalidates declared peers on change ("push all
/// but the instigator").
#[derive(Clone)]
pub struct OutputPortManager {
    inner: Rc<OpmInner>,
}

impl OutputPortManager {
    pub fn new(port: OutputPort, write_action: WriteAction) -> Self {
        let manager = Self {
            inner: Rc::new(OpmInner {
                port: port.clone(),
                write_action,
                compute: RefCell::new(None),
                buffer: RefCell::new(None),
                valid: Cell::new(false),
                peers: RefCell::new(Vec::new()),
            }),
        };
        // The port serves takes from the managed value.
        let weak = Rc::downgrade(&manager.inner);
        port.set_take_handler(Rc::new(move |_, _| {
            weak.upgrade()
                .map(OutputPortManager::from_inner)
                .and_then(|m| m.value())
        }));
        manager
    }

    fn from_inner(inner: Rc<OpmInner>) -> Self {
        Self { inner }
    }

    pub fn port(&self) -> &OutputPort {
        &self.inner.port
    }

    pub fn set_compute<F: Fn() -> Option<PortItem> + 'static>(&self, f: F) {
        *self.inner.compute.borrow_mut() = Some(Rc::new(f));
        self.inner.valid.set(false);
    }

    pub fn add_peer(&self, peer: &OutputPortManager) {
        self.inner
            .peers
            .borrow_mut()
            .push(Rc::downgrade(&peer.inner));
    }

    /// The current value, computing it lazily if the cache is invalid.
    pub fn value(&self) -> Option<PortItem> {
        if !self.inner.valid.get() {
            let compute = self.inner.compute.borrow().clone();
            let fresh = compute.and_then(|f| f());
            *self.inner.buffer.borrow_mut() = fresh;
            self.inner.valid.set(true);
        }
        self.inner.buffer.borrow().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.get()
    }

    pub fn invalidate(&self) {
        self.inner.valid.set(false);
    }

    pub fn write(&self, item: PortItem) {
        match self.inner.write_action {
            WriteAction::Ignore => {}
            WriteAction::Store => {
                *self.inner.buffer.borrow_mut() = Some(item);
                self.inner.valid.set(true);
            }
            WriteAction::StoreAndInvalidate => {
                *self.inner.buffer.borrow_mut() = Some(item);
                self.inner.valid.set(true);
                self.push_all_but(Some(self.inner.port.guid()));
            }
            WriteAction::Push => {
                *self.inner.buffer.borrow_mut() = Some(item);
                self.inner.valid.set(true);
                self.push_all_but(None);
            }
        }
    }

    /// Invalidate every declared peer except the instigator, so their
    /// next take recomputes.
    pub fn push_all_but(&self, instigator: Option<Uuid>) {
        let peers: Vec<Rc<OpmInner>> = self
            .inner
            .peers
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for peer in peers {
            if Some(peer.port.guid()) == instigator {
                continue;
            }
            peer.valid.set(false);
        }
    }
}
