use crate::config::SimConfig;
use crate::error::{ErrorLog, ModelError, SimError, SimResult};
use crate::executive::Executive;
use crate::graph::{GraphContext, TaskGraph, TaskRunner};
use crate::observe::{Listeners, ModelEvent};
use crate::resource::ResourceManager;
use crate::state::{StateMachine, TransitionResult};
use crate::types::{ExecState, ListenerId, ModelState};
use std::any::{Any, TypeId};
use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info};
use uuid::Uuid;

/// Anything registrable on a model: uniquely identified, named.
pub trait ModelObject: Any {
    fn guid(&self) -> Uuid;
    fn name(&self) -> &str;
}

/// Activated when the model starts; schedules its master-task start
/// events against the executive.
pub trait TaskProcessor {
    fn name(&self) -> &str;
    fn activate(&self, model: &Model) -> SimResult<()>;
}

struct ModelShared {
    name: String,
    config: SimConfig,
    executive: Executive,
    machine: RefCell<StateMachine<ModelState>>,
    objects: RefCell<HashMap<Uuid, Rc<dyn ModelObject>>>,
    names: RefCell<HashMap<String, Uuid>>,
    services: RefCell<HashMap<TypeId, Rc<dyn Any>>>,
    processors: RefCell<Vec<Rc<dyn TaskProcessor>>>,
    contexts: RefCell<Vec<GraphContext>>,
    errors: ErrorLog,
    listeners: Listeners<ModelEvent>,
}

/// Binds the executive, the lifecycle state machine, the named object
/// registry, the interface-keyed service registry, and the error
/// collection into one runnable unit.
#[derive(Clone)]
pub struct Model {
    shared: Rc<ModelShared>,
}

impl Model {
    pub fn new(name: &str, config: SimConfig) -> Self {
        let errors = ErrorLog::new();
        let executive = Executive::with_error_log(config.clone(), errors.clone());

        let mut machine = StateMachine::new(ModelState::Init);
        machine.declare(ModelState::Init, ModelState::Running);
        machine.declare(ModelState::Running, ModelState::Paused);
        machine.declare(ModelState::Paused, ModelState::Running);
        machine.declare(ModelState::Running, ModelState::Stopped);
        machine.declare(ModelState::Stopped, ModelState::Finished);
        machine.declare(ModelState::Stopped, ModelState::Init);
        machine.declare(ModelState::Finished, ModelState::Init);

        if config.abort_on_error {
            let exec = executive.clone();
            errors.set_hook(Rc::new(move |_: &ModelError| {
                exec.stop();
            }));
        }

        let model = Self {
            shared: Rc::new(ModelShared {
                name: name.to_string(),
                config,
                executive,
                machine: RefCell::new(machine),
                objects: RefCell::new(HashMap::new()),
                names: RefCell::new(HashMap::new()),
                services: RefCell::new(HashMap::new()),
                processors: RefCell::new(Vec::new()),
                contexts: RefCell::new(Vec::new()),
                errors,
                listeners: Listeners::new(),
            }),
        };

        // Default services: task management and resource management,
        // resolvable by interface type.
        let graph = TaskGraph::new();
        let runner = TaskRunner::new(&graph, model.executive());
        model
            .add_service(Rc::new(graph))
            .expect("fresh service registry");
        model
            .add_service(Rc::new(runner))
            .expect("fresh service registry");
        model
            .add_service(Rc::new(ResourceManager::new("default")))
            .expect("fresh service registry");
        model
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &SimConfig {
        &self.shared.config
    }

    pub fn executive(&self) -> &Executive {
        &self.shared.executive
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.shared.errors
    }

    pub fn state(&self) -> ModelState {
        self.shared.machine.borrow().current()
    }

    /// Mutable access to the lifecycle machine, e.g. to veto
    /// transitions with test handlers. Do not call model lifecycle
    /// methods from inside a handler.
    pub fn machine(&self) -> RefMut<'_, StateMachine<ModelState>> {
        self.shared.machine.borrow_mut()
    }

    pub fn on_lifecycle<F: Fn(&ModelEvent) + 'static>(&self, f: F) -> ListenerId {
        self.shared.listeners.subscribe_fn(f)
    }

    // ── Registries ──

    /// Registers a named object. Guids and names are unique.
    pub fn register_object(&self, object: Rc<dyn ModelObject>) -> SimResult<()> {
        let guid = object.guid();
        let name = object.name().to_string();
        let mut objects = self.shared.objects.borrow_mut();
        let mut names = self.shared.names.borrow_mut();
        if objects.contains_key(&guid) {
            return Err(SimError::Structural {
                reason: format!("duplicate model object guid {guid}"),
            });
        }
        if names.contains_key(&name) {
            return Err(SimError::Structural {
                reason: format!("duplicate model object name '{name}'"),
            });
        }
        names.insert(name, guid);
        objects.insert(guid, object);
        Ok(())
    }

    pub fn object(&self, guid: Uuid) -> Option<Rc<dyn ModelObject>> {
        self.shared.objects.borrow().get(&guid).cloned()
    }

    pub fn object_by_name(&self, name: &str) -> Option<Rc<dyn ModelObject>> {
        let guid = *self.shared.names.borrow().get(name)?;
        self.object(guid)
    }

    /// Registers a service under its concrete type, resolvable with
    /// [`Model::service`]. One instance per interface.
    pub fn add_service<T: Any>(&self, service: Rc<T>) -> SimResult<()> {
        let mut services = self.shared.services.borrow_mut();
        let key = TypeId::of::<T>();
        if services.contains_key(&key) {
            return Err(SimError::Structural {
                reason: format!("duplicate service {}", std::any::type_name::<T>()),
            });
        }
        services.insert(key, service);
        Ok(())
    }

    pub fn service<T: Any>(&self) -> Option<Rc<T>> {
        let services = self.shared.services.borrow();
        services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|s| s.downcast::<T>().ok())
    }

    pub fn task_graph(&self) -> Rc<TaskGraph> {
        self.service::<TaskGraph>().expect("registered at construction")
    }

    pub fn task_runner(&self) -> Rc<TaskRunner> {
        self.service::<TaskRunner>().expect("registered at construction")
    }

    pub fn resource_manager(&self) -> Rc<ResourceManager> {
        self.service::<ResourceManager>()
            .expect("registered at construction")
    }

    pub fn add_task_processor(&self, processor: Rc<dyn TaskProcessor>) -> SimResult<()> {
        let mut processors = self.shared.processors.borrow_mut();
        if processors.iter().any(|p| p.name() == processor.name()) {
            return Err(SimError::Structural {
                reason: format!("duplicate task processor '{}'", processor.name()),
            });
        }
        processors.push(processor);
        Ok(())
    }

    /// Graph contexts registered here get their volatile keys cleared at
    /// every run start.
    pub fn register_context(&self, ctx: &GraphContext) {
        self.shared.contexts.borrow_mut().push(ctx.clone());
    }

    // ── Lifecycle ──

    /// Transition to Running, activate task processors, and drive the
    /// executive until it finishes or pauses.
    pub fn start(&self) -> SimResult<()> {
        self.transition(ModelState::Running)?;
        info!(target: "sim_lite::model", model = %self.shared.name, "starting");
        for ctx in self.shared.contexts.borrow().iter() {
            self.shared.executive.clear_volatiles(ctx);
        }
        self.shared.listeners.emit(&ModelEvent::Starting);
        let processors: Vec<Rc<dyn TaskProcessor>> =
            self.shared.processors.borrow().iter().cloned().collect();
        for processor in processors {
            processor.activate(self)?;
        }
        self.shared.listeners.emit(&ModelEvent::Started);
        self.shared.executive.start()?;
        self.after_run()
    }

    /// Resume a paused model and drive the run to its end.
    pub fn resume(&self) -> SimResult<()> {
        self.transition(ModelState::Running)?;
        self.shared.executive.resume()?;
        self.after_run()
    }

    fn after_run(&self) -> SimResult<()> {
        match self.shared.executive.state() {
            ExecState::Paused => {
                self.transition(ModelState::Paused)?;
                Ok(())
            }
            _ => {
                self.shared.listeners.emit(&ModelEvent::Stopping);
                self.transition(ModelState::Stopped)?;
                self.shared.listeners.emit(&ModelEvent::Stopped);
                self.transition(ModelState::Finished)?;
                debug!(target: "sim_lite::model", model = %self.shared.name, errors = self.shared.errors.len(), "finished");
                Ok(())
            }
        }
    }

    /// Request the executive stop; the in-flight `start` call observes
    /// it and walks the model to Finished.
    pub fn stop(&self) {
        self.shared.executive.stop();
    }

    pub fn pause(&self) {
        self.shared.executive.pause();
    }

    /// Return to Init with a cleared queue; registered contexts keep
    /// their non-volatile entries.
    pub fn reset(&self) -> SimResult<()> {
        self.shared.executive.reset()?;
        self.transition(ModelState::Init)?;
        self.shared.listeners.emit(&ModelEvent::Reset);
        Ok(())
    }

    /// Start and collect the error log once finished.
    pub fn run_to_completion(&self) -> SimResult<Vec<ModelError>> {
        self.start()?;
        Ok(self.shared.errors.snapshot())
    }

    fn transition(&self, to: ModelState) -> SimResult<()> {
        let result = self.shared.machine.borrow_mut().do_transition(to);
        match result {
            TransitionResult::Success => Ok(()),
            TransitionResult::Failure(reasons) => Err(SimError::StateMachine {
                reason: reasons.join("; "),
            }),
            TransitionResult::NotPermitted => Err(SimError::StateMachine {
                reason: format!("transition to {to:?} not permitted from {:?}", self.state()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executive::EventData;
    use crate::types::epoch_plus_minutes as m;

    struct Widget {
        guid: Uuid,
        name: String,
    }

    impl ModelObject for Widget {
        fn guid(&self) -> Uuid {
            self.guid
        }
        fn name(&self) -> &str {
            &self.name
        }
    }

    struct OneShot {
        fired: Rc<RefCell<Option<crate::types::SimTime>>>,
    }

    impl TaskProcessor for OneShot {
        fn name(&self) -> &str {
            "one-shot"
        }
        fn activate(&self, model: &Model) -> SimResult<()> {
            let fired = self.fired.clone();
            model.executive().request_event(
                move |ex: &Executive, _: &EventData| {
                    *fired.borrow_mut() = Some(ex.now());
                    Ok(())
                },
                m(3),
            )?;
            Ok(())
        }
    }

    #[test]
    fn model_walks_init_running_stopped_finished() {
        let model = Model::new("m", SimConfig::default());
        let fired = Rc::new(RefCell::new(None));
        model
            .add_task_processor(Rc::new(OneShot {
                fired: fired.clone(),
            }))
            .unwrap();
        let events = Rc::new(RefCell::new(Vec::new()));
        let e = events.clone();
        model.on_lifecycle(move |ev: &ModelEvent| e.borrow_mut().push(*ev));

        assert_eq!(model.state(), ModelState::Init);
        model.start().unwrap();
        assert_eq!(model.state(), ModelState::Finished);
        assert_eq!(*fired.borrow(), Some(m(3)));
        assert_eq!(
            &*events.borrow(),
            &[
                ModelEvent::Starting,
                ModelEvent::Started,
                ModelEvent::Stopping,
                ModelEvent::Stopped,
            ]
        );
    }

    #[test]
    fn vetoed_start_leaves_the_model_in_init() {
        let model = Model::new("m", SimConfig::default());
        model
            .machine()
            .add_test(ModelState::Init, ModelState::Running, true, |_, _| {
                Err("not configured".into())
            });
        let err = model.start().unwrap_err();
        assert!(matches!(err, SimError::StateMachine { .. }));
        assert_eq!(model.state(), ModelState::Init);
    }

    #[test]
    fn duplicate_registrations_are_structural_errors() {
        let model = Model::new("m", SimConfig::default());
        let guid = Uuid::new_v4();
        model
            .register_object(Rc::new(Widget {
                guid,
                name: "w".into(),
            }))
            .unwrap();
        // Same name, fresh guid.
        assert!(matches!(
            model.register_object(Rc::new(Widget {
                guid: Uuid::new_v4(),
                name: "w".into(),
            })),
            Err(SimError::Structural { .. })
        ));
        assert!(model.object_by_name("w").is_some());
        assert!(model.object(guid).is_some());

        assert!(matches!(
            model.add_service(Rc::new(ResourceManager::new("second"))),
            Err(SimError::Structural { .. })
        ));
    }

    #[test]
    fn abort_on_error_stops_the_run() {
        let config = SimConfig {
            abort_on_error: true,
            ..Default::default()
        };
        let model = Model::new("m", config);
        let late = Rc::new(RefCell::new(false));
        let exec = model.executive().clone();
        exec.request_event(
            |_, _| {
                Err(SimError::TaskExecution {
                    reason: "fatal".into(),
                })
            },
            m(1),
        )
        .unwrap();
        let l = late.clone();
        exec.request_event(
            move |_, _| {
                *l.borrow_mut() = true;
                Ok(())
            },
            m(2),
        )
        .unwrap();
        model.start().unwrap();
        assert_eq!(model.state(), ModelState::Finished);
        assert_eq!(model.errors().len(), 1);
        assert!(!*late.borrow(), "events after the abort must not run");
    }

    #[test]
    fn volatile_context_keys_clear_at_run_start() {
        let model = Model::new("m", SimConfig::default());
        let ctx = GraphContext::new();
        let keep = Uuid::new_v4();
        let scratch = Uuid::new_v4();
        ctx.set(keep, Rc::new(1u32));
        ctx.set_volatile(scratch, Rc::new(2u32));
        model.register_context(&ctx);
        model.executive().request_event(|_, _| Ok(()), m(1)).unwrap();
        model.start().unwrap();
        assert!(ctx.contains(keep));
        assert!(!ctx.contains(scratch));
    }

    #[test]
    fn pause_and_resume_cross_the_paused_state() {
        let model = Model::new("m", SimConfig::default());
        let exec = model.executive().clone();
        let pauser = model.clone();
        exec.request_event(
            move |_, _| {
                pauser.pause();
                Ok(())
            },
            m(1),
        )
        .unwrap();
        exec.request_event(|_, _| Ok(()), m(2)).unwrap();
        model.start().unwrap();
        assert_eq!(model.state(), ModelState::Paused);
        model.resume().unwrap();
        assert_eq!(model.state(), ModelState::Finished);
    }
}
