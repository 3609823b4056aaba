use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::StageError;
use crate::registry::ServiceRegistry;
use crate::task::{EventKind, Reply, Task};

/// Decides whether a stage acts on a published task.
#[derive(Clone)]
pub enum Predicate {
    Always,
    Tag(String),
    AnyTag(Vec<String>),
    /// Matches every generation of requests raised by one kind of connection
    /// lifecycle event.
    Event(EventKind),
    /// Matches when every inner predicate does.
    All(Vec<Predicate>),
    Custom(Arc<dyn Fn(&Task) -> bool + Send + Sync>),
}

impl Predicate {
    pub fn tag(tag: impl Into<String>) -> Self {
        Predicate::Tag(tag.into())
    }

    pub fn any_tag<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::AnyTag(tags.into_iter().map(Into::into).collect())
    }

    pub fn event(kind: EventKind) -> Self {
        Predicate::Event(kind)
    }

    pub fn all(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::All(predicates.into_iter().collect())
    }

    pub fn when<F>(f: F) -> Self
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        Predicate::Custom(Arc::new(f))
    }

    pub fn matches(&self, task: &Task) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Tag(tag) => task.tag() == tag,
            Predicate::AnyTag(tags) => tags.iter().any(|t| t == task.tag()),
            Predicate::Event(kind) => task.request().event == *kind,
            Predicate::All(all) => all.iter().all(|p| p.matches(task)),
            Predicate::Custom(f) => f(task),
        }
    }

    /// Tags this predicate is keyed on, if it only ever matches exact tags.
    pub fn keys(&self) -> Option<Vec<&str>> {
        match self {
            Predicate::Tag(tag) => Some(vec![tag.as_str()]),
            Predicate::AnyTag(tags) => Some(tags.iter().map(String::as_str).collect()),
            // A conjunction only matches tasks its keyed member matches.
            Predicate::All(all) => all.iter().find_map(Predicate::keys),
            Predicate::Always | Predicate::Event(_) | Predicate::Custom(_) => None,
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Always => f.write_str("Always"),
            Predicate::Tag(tag) => f.debug_tuple("Tag").field(tag).finish(),
            Predicate::AnyTag(tags) => f.debug_tuple("AnyTag").field(tags).finish(),
            Predicate::Event(kind) => f.debug_tuple("Event").field(kind).finish(),
            Predicate::All(all) => f.debug_tuple("All").field(all).finish(),
            Predicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// What a stage action produced.
#[derive(Debug)]
pub enum Outcome {
    /// Side effect performed, nothing to republish.
    Done,
    /// Republish this task to continue the chain.
    Continue(Task),
}

/// Everything a stage action gets to work with.
pub struct StageInput {
    task: Arc<Task>,
    stage: Arc<str>,
    services: Arc<ServiceRegistry>,
}

impl StageInput {
    pub fn new(task: Arc<Task>, stage: Arc<str>, services: Arc<ServiceRegistry>) -> Self {
        Self { task, stage, services }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn shared(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// The scoped copy this stage may mutate and republish.
    pub fn fork(&self) -> Task {
        self.task.scoped(&self.stage)
    }
}

pub struct TerminalInput {
    pub task: Task,
    pub services: Arc<ServiceRegistry>,
}

pub type StageAction =
    Arc<dyn Fn(StageInput) -> BoxFuture<'static, Result<Outcome, StageError>> + Send + Sync>;
pub type TerminalAction =
    Arc<dyn Fn(TerminalInput) -> BoxFuture<'static, Result<Reply, StageError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageMode {
    /// Every matched delivery runs as its own runtime task.
    #[default]
    Concurrent,
    /// Deliveries run one after another in the order the stage received them.
    Serial,
}

#[derive(Clone)]
pub struct Stage {
    name: Arc<str>,
    predicate: Predicate,
    action: StageAction,
    mode: StageMode,
}

impl Stage {
    pub fn new<F, Fut>(name: &str, predicate: Predicate, action: F) -> Self
    where
        F: Fn(StageInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome, StageError>> + Send + 'static,
    {
        Self {
            name: Arc::from(name),
            predicate,
            action: Arc::new(move |input: StageInput| action(input).boxed()),
            mode: StageMode::Concurrent,
        }
    }

    /// Continuation stage: forks the task, lets `f` mutate the copy, and
    /// republishes it.
    pub fn map<F>(name: &str, predicate: Predicate, f: F) -> Self
    where
        F: Fn(&mut Task) -> Result<(), StageError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, predicate, move |input: StageInput| {
            let f = f.clone();
            async move {
                let mut next = input.fork();
                f(&mut next)?;
                Ok::<_, StageError>(Outcome::Continue(next))
            }
        })
    }

    /// Side-effect stage that never republishes.
    pub fn tap<F>(name: &str, predicate: Predicate, f: F) -> Self
    where
        F: Fn(&Task) -> Result<(), StageError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, predicate, move |input: StageInput| {
            let f = f.clone();
            async move {
                f(input.task())?;
                Ok::<_, StageError>(Outcome::Done)
            }
        })
    }

    pub fn serial(mut self) -> Self {
        self.mode = StageMode::Serial;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn action(&self) -> &StageAction {
        &self.action
    }

    pub fn mode(&self) -> StageMode {
        self.mode
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("predicate", &self.predicate)
            .field("mode", &self.mode)
            .finish()
    }
}

/// The one stage that answers the network peer.
#[derive(Clone)]
pub struct Terminal {
    name: Arc<str>,
    predicate: Predicate,
    action: TerminalAction,
}

impl Terminal {
    pub fn new<F, Fut>(name: &str, predicate: Predicate, action: F) -> Self
    where
        F: Fn(TerminalInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, StageError>> + Send + 'static,
    {
        Self {
            name: Arc::from(name),
            predicate,
            action: Arc::new(move |input: TerminalInput| action(input).boxed()),
        }
    }

    /// Terminal replying `200` with the task buffer as body.
    pub fn echo(name: &str, predicate: Predicate) -> Self {
        Self::new(name, predicate, |input: TerminalInput| async move {
            Ok::<_, StageError>(Reply::ok(input.task.buffer().to_vec()))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn action(&self) -> &TerminalAction {
        &self.action
    }
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal")
            .field("name", &self.name)
            .field("predicate", &self.predicate)
            .finish()
    }
}
