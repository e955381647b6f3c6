//! A scripted bootstrapper application.
//!
//! [`ScriptedBa`] records every callback and answers from a script: one-shot
//! replies are used first, then standing replies, then a custom responder,
//! then the default reply. Attached to a queue with
//! [`ScriptedBa::driving`], it also walks the engine through detect, plan and
//! apply the way an unattended application would.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use burn_core::BoxFuture;
use burn_core::ba::passive::exit_code;
use burn_core::ba::{ActionQueue, BaEvent, BaReply, BootstrapperApplication, EngineAction};
use burn_core::hresult::HResult;
use burn_core::model::BundleAction;

type Responder = Box<dyn Fn(&BaEvent) -> Option<BaReply> + Send + Sync>;

#[derive(Default)]
pub struct ScriptedBa {
    events: Mutex<Vec<BaEvent>>,
    once: Mutex<HashMap<&'static str, VecDeque<BaReply>>>,
    always: HashMap<&'static str, BaReply>,
    responder: Option<Responder>,
    driving: Option<(Arc<ActionQueue>, BundleAction)>,
}

impl std::fmt::Debug for ScriptedBa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBa")
            .field("events", &self.names())
            .finish_non_exhaustive()
    }
}

impl ScriptedBa {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue detect on startup, then plan `action`, apply and quit as each
    /// step completes.
    pub fn driving(mut self, queue: Arc<ActionQueue>, action: BundleAction) -> Self {
        self.driving = Some((queue, action));
        self
    }

    /// Answer the next `event` (by [`BaEvent::name`]) with `reply`.
    pub fn reply_once(self, event: &'static str, reply: BaReply) -> Self {
        self.once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event)
            .or_default()
            .push_back(reply);
        self
    }

    /// Answer every `event` with `reply`.
    pub fn reply_always(mut self, event: &'static str, reply: BaReply) -> Self {
        self.always.insert(event, reply);
        self
    }

    /// Answer with `f` when it returns a reply.
    pub fn respond_with(
        mut self,
        f: impl Fn(&BaEvent) -> Option<BaReply> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(f));
        self
    }

    pub fn events(&self) -> Vec<BaEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(BaEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }

    pub fn last(&self, name: &str) -> Option<BaEvent> {
        self.events().into_iter().rev().find(|e| e.name() == name)
    }

    fn reply_for(&self, event: &BaEvent) -> BaReply {
        let name = event.name();
        let scripted = self
            .once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(name)
            .and_then(VecDeque::pop_front);
        scripted
            .or_else(|| self.always.get(name).cloned())
            .or_else(|| self.responder.as_ref().and_then(|f| f(event)))
            .unwrap_or_default()
    }

    fn drive(&self, event: &BaEvent) {
        let Some((queue, action)) = &self.driving else {
            return;
        };
        let next = match event {
            BaEvent::Startup => Some(EngineAction::Detect),
            BaEvent::DetectComplete { status } => Some(step(*status, EngineAction::Plan(*action))),
            BaEvent::PlanComplete { status } => Some(step(*status, EngineAction::Apply)),
            BaEvent::ApplyComplete { status, restart } => {
                Some(EngineAction::Quit(exit_code(*status, *restart)))
            }
            _ => None,
        };
        if let Some(next) = next {
            let _ = queue.enqueue(next);
        }
    }
}

fn step(status: HResult, next: EngineAction) -> EngineAction {
    if status.is_success() {
        next
    } else {
        EngineAction::Quit(exit_code(status, Default::default()))
    }
}

impl BootstrapperApplication for ScriptedBa {
    fn on_event(&self, event: BaEvent) -> BoxFuture<'_, BaReply> {
        let reply = self.reply_for(&event);
        self.drive(&event);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Box::pin(async move { reply })
    }
}
