use derive_where::derive_where;
use generativity::{Guard, Id};
use itertools::Itertools;
use priority_queue::PriorityQueue;
use rustc_hash::FxHasher;
use std::{
    cell::{Ref, RefCell, RefMut},
    cmp::Reverse,
    collections::VecDeque,
    fmt::Debug,
    hash::{BuildHasherDefault, Hash},
    marker::PhantomData,
    ops::{Deref, DerefMut},
    rc::Rc,
};

use crate::{
    quantities::{Time, TimeSpan},
    util::logging::Logger,
};

pub trait HasSubEffect<P>: From<P> + TryInto<P> {}

impl<E, P> HasSubEffect<P> for E where E: From<P> + TryInto<P> {}

#[derive_where(Debug)]
pub enum DynComponent<'sim, 'a, P, E> {
    Owned(Box<dyn Component<'sim, E, Receive = P> + 'a>),
    Shared(Rc<RefCell<dyn Component<'sim, E, Receive = P> + 'a>>),
}

impl<'sim, 'a, P, E> DynComponent<'sim, 'a, P, E> {
    #[must_use]
    pub fn new<T: Component<'sim, E, Receive = P> + 'a>(value: T) -> DynComponent<'sim, 'a, P, E> {
        DynComponent::Owned(Box::new(value))
    }

    /// Keeps a handle outside the simulator so the component can be inspected after a run.
    #[must_use]
    pub fn shared<T: Component<'sim, E, Receive = P> + 'a>(
        value: Rc<RefCell<T>>,
    ) -> DynComponent<'sim, 'a, P, E> {
        DynComponent::Shared(value)
    }
}

pub enum DynComponentRef<'sim, 'a, P, E> {
    Ref(&'a dyn Component<'sim, E, Receive = P>),
    ScopedRef(Ref<'a, dyn Component<'sim, E, Receive = P>>),
}

pub enum DynComponentRefMut<'sim, 'a, P, E> {
    Ref(&'a mut (dyn Component<'sim, E, Receive = P>)),
    ScopedRef(RefMut<'a, dyn Component<'sim, E, Receive = P>>),
}

impl<'sim, 'a, P, E> DynComponent<'sim, 'a, P, E> {
    #[must_use]
    pub fn borrow(&self) -> DynComponentRef<'sim, '_, P, E> {
        match self {
            DynComponent::Owned(x) => DynComponentRef::Ref(x.as_ref()),
            DynComponent::Shared(x) => DynComponentRef::ScopedRef(x.borrow()),
        }
    }

    #[must_use]
    pub fn borrow_mut(&mut self) -> DynComponentRefMut<'sim, '_, P, E> {
        match self {
            DynComponent::Owned(x) => DynComponentRefMut::Ref(x.as_mut()),
            DynComponent::Shared(x) => DynComponentRefMut::ScopedRef(x.borrow_mut()),
        }
    }
}

impl<'sim, 'a, P, E> Deref for DynComponentRef<'sim, 'a, P, E> {
    type Target = dyn Component<'sim, E, Receive = P> + 'a;

    fn deref(&self) -> &(dyn Component<'sim, E, Receive = P> + 'a) {
        match self {
            DynComponentRef::Ref(r) => *r,
            DynComponentRef::ScopedRef(s) => &**s,
        }
    }
}

impl<'sim, 'a, P, E> Deref for DynComponentRefMut<'sim, 'a, P, E> {
    type Target = dyn Component<'sim, E, Receive = P> + 'a;

    fn deref(&self) -> &(dyn Component<'sim, E, Receive = P> + 'a) {
        match self {
            DynComponentRefMut::Ref(r) => *r,
            DynComponentRefMut::ScopedRef(s) => &**s,
        }
    }
}

impl<'sim, 'a, P, E> DerefMut for DynComponentRefMut<'sim, 'a, P, E> {
    fn deref_mut(&mut self) -> &mut (dyn Component<'sim, E, Receive = P> + 'a) {
        match self {
            DynComponentRefMut::Ref(r) => *r,
            DynComponentRefMut::ScopedRef(s) => &mut **s,
        }
    }
}

#[derive(Hash, PartialEq, Eq, Clone, Copy)]
pub struct ComponentId<'sim> {
    index: usize,
    sim_id: Id<'sim>,
}

impl<'sim> Debug for ComponentId<'sim> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ComponentId").field(&self.index).finish()
    }
}

impl<'sim> ComponentId<'sim> {
    #[must_use]
    const fn new(index: usize, sim_id: Id<'sim>) -> ComponentId {
        ComponentId { index, sim_id }
    }
}

/// A typed handle for sending `I` messages to one component of a simulation.
#[derive_where(Clone)]
pub struct Address<'sim, I, E> {
    component_id: ComponentId<'sim>,
    create_message: Rc<dyn Fn(I) -> Message<'sim, E> + 'sim>,
}

impl<'sim, I, E> Debug for Address<'sim, I, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Address")
            .field(&self.component_id.index)
            .finish()
    }
}

impl<'sim, T: 'sim> Address<'sim, T, T> {
    fn new(component_id: ComponentId<'sim>) -> Address<'sim, T, T> {
        Address {
            component_id,
            create_message: Rc::new(move |effect| Message {
                component_id,
                effect,
            }),
        }
    }
}

impl<'sim, I, E> Address<'sim, I, E> {
    #[must_use]
    pub fn cast<J>(self) -> Address<'sim, J, E>
    where
        I: From<J> + 'sim,
        J: 'sim,
        E: 'sim,
    {
        Address {
            component_id: self.component_id,
            create_message: Rc::new(move |effect| (self.create_message)(effect.into())),
        }
    }

    pub fn create_message(&self, effect: I) -> Message<'sim, E> {
        (self.create_message)(effect)
    }

    #[must_use]
    pub const fn component_id(&self) -> ComponentId<'sim> {
        self.component_id
    }
}

pub struct Message<'sim, E> {
    component_id: ComponentId<'sim>,
    effect: E,
}

#[derive(Debug, Clone, Copy)]
pub struct EffectContext {
    pub time: Time,
}

pub trait Component<'sim, E>: Debug {
    type Receive;
    /// The next virtual time this component wants to tick at, if any.
    fn next_tick(&self, time: Time) -> Option<Time>;
    fn tick(&mut self, context: EffectContext) -> Vec<Message<'sim, E>>;
    fn receive(&mut self, e: Self::Receive, context: EffectContext) -> Vec<Message<'sim, E>>;
}

/// Holds at most one pending entry per id, ordered by time and then by the
/// order in which the entries were scheduled.
#[derive(Debug)]
pub struct EventQueue<I: Hash + Eq> {
    current_time: Time,
    next_seq: u64,
    queue: PriorityQueue<I, Reverse<(Time, u64)>, BuildHasherDefault<FxHasher>>,
}

impl<I: Hash + Eq> EventQueue<I> {
    #[must_use]
    pub fn new() -> EventQueue<I> {
        EventQueue {
            current_time: Time::MIN,
            next_seq: 0,
            queue: PriorityQueue::with_default_hasher(),
        }
    }

    /// Schedules `id` for `time`, or unschedules it when `time` is `None`.
    /// Rescheduling an id for the time it is already queued at keeps its place.
    pub fn update(&mut self, id: I, time: Option<Time>) {
        if let Some(time) = time {
            assert!(
                time >= self.current_time,
                "Tried to schedule an event at {time}, before the current time {}",
                self.current_time
            );
            if let Some(Reverse((queued, _))) = self.queue.get_priority(&id) {
                if *queued == time {
                    return;
                }
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            self.queue.push(id, Reverse((time, seq)));
        } else {
            self.queue.remove(&id);
        }
    }

    #[must_use]
    pub fn next_time(&self) -> Option<Time> {
        self.queue.peek().map(|(_, Reverse((time, _)))| *time)
    }

    pub fn pop_next(&mut self) -> Option<(Time, I)> {
        let (id, Reverse((time, _))) = self.queue.pop()?;
        self.current_time = time;
        Some((time, id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<I: Hash + Eq> Default for EventQueue<I> {
    fn default() -> Self {
        Self::new()
    }
}

struct EffectQueue<'sim, E> {
    queue: VecDeque<Message<'sim, E>>,
}

impl<'sim, E> EffectQueue<'sim, E> {
    const fn new() -> EffectQueue<'sim, E> {
        EffectQueue {
            queue: VecDeque::new(),
        }
    }

    fn push_all<T: IntoIterator<Item = Message<'sim, E>>>(&mut self, effects: T) {
        self.queue.extend(effects);
    }

    fn pop_next(&mut self) -> Option<Message<'sim, E>> {
        self.queue.pop_front()
    }
}

pub struct ComponentSlot<'sim, 'a, 'b, P, E> {
    index: usize,
    builder: &'b SimulatorBuilder<'sim, 'a, E>,
    receive: PhantomData<P>,
    address: Address<'sim, P, E>,
}

impl<'sim: 'a, 'a, 'b, P: 'a, E: 'a> ComponentSlot<'sim, 'a, 'b, P, E>
where
    E: HasSubEffect<P>,
{
    #[must_use]
    pub fn address(&self) -> Address<'sim, P, E> {
        self.address.clone()
    }

    #[allow(clippy::must_use_candidate)]
    pub fn set(self, component: DynComponent<'sim, 'a, P, E>) -> Address<'sim, P, E> {
        let mut components = self.builder.components.borrow_mut();
        assert!(components[self.index].is_none());
        components[self.index] = Some(Box::new(ComponentWrapper::new(component)));
        self.address
    }
}

pub struct SimulatorBuilder<'sim, 'a, E> {
    id: Id<'sim>,
    #[allow(clippy::type_complexity)]
    components: RefCell<Vec<Option<Box<dyn Component<'sim, E, Receive = E> + 'a>>>>,
}

impl<'sim: 'a, 'a, E: 'a> SimulatorBuilder<'sim, 'a, E> {
    #[must_use]
    pub fn new(guard: Guard<'sim>) -> SimulatorBuilder<'sim, 'a, E> {
        SimulatorBuilder {
            id: guard.into(),
            components: RefCell::new(Vec::new()),
        }
    }

    pub fn insert<P>(&self, component: DynComponent<'sim, 'a, P, E>) -> Address<'sim, P, E>
    where
        E: HasSubEffect<P> + 'sim,
        P: 'sim + 'a,
    {
        let mut components = self.components.borrow_mut();
        let id = ComponentId::new(components.len(), self.id);
        components.push(Some(Box::new(ComponentWrapper::new(component))));
        Address::new(id).cast()
    }

    /// Reserves a place for a component that needs its own address before it can be built.
    pub fn reserve_slot<'b, P>(&'b self) -> ComponentSlot<'sim, 'a, 'b, P, E>
    where
        E: From<P> + 'sim,
        P: 'sim + 'a,
    {
        let mut components = self.components.borrow_mut();
        let index = components.len();
        components.push(None);
        ComponentSlot {
            index,
            builder: self,
            receive: PhantomData,
            address: Address::new(ComponentId::new(index, self.id)).cast(),
        }
    }

    /// # Panics
    ///
    /// Panics if a reserved slot was never filled.
    pub fn build<L>(self, logger: L) -> Simulator<'sim, 'a, E, L> {
        let components = self
            .components
            .into_inner()
            .into_iter()
            .map(|c| c.expect("Reserved component slot was never filled"))
            .collect_vec();
        Simulator {
            id: self.id,
            tick_queue: EventQueue::new(),
            components,
            events: 0,
            logger,
        }
    }
}

#[derive_where(Debug)]
struct ComponentWrapper<'sim, 'a, P, E> {
    inner: DynComponent<'sim, 'a, P, E>,
}

impl<'sim, 'a, P, E> ComponentWrapper<'sim, 'a, P, E> {
    pub const fn new(inner: DynComponent<'sim, 'a, P, E>) -> ComponentWrapper<'sim, 'a, P, E> {
        ComponentWrapper { inner }
    }
}

impl<'sim, 'a, P, E> Component<'sim, E> for ComponentWrapper<'sim, 'a, P, E>
where
    E: HasSubEffect<P>,
{
    type Receive = E;

    fn next_tick(&self, time: Time) -> Option<Time> {
        self.inner.borrow().next_tick(time)
    }

    fn tick(&mut self, context: EffectContext) -> Vec<Message<'sim, E>> {
        self.inner.borrow_mut().tick(context)
    }

    fn receive(&mut self, e: E, context: EffectContext) -> Vec<Message<'sim, E>> {
        self.inner.borrow_mut().receive(
            e.try_into()
                .map_or_else(|_| panic!("Incorrect message type!"), |x| x),
            context,
        )
    }
}

/// What a finished run looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Time of the last tick that was processed.
    pub end_time: Time,
    /// Number of ticks processed, not counting message deliveries.
    pub events: u64,
    /// True when the run stopped because nothing was left to schedule.
    pub exhausted: bool,
}

pub struct Simulator<'sim, 'a, E, L> {
    id: Id<'sim>,
    components: Vec<Box<dyn Component<'sim, E, Receive = E> + 'a>>,
    tick_queue: EventQueue<usize>,
    events: u64,
    logger: L,
}

impl<'sim, 'a, E, L> Simulator<'sim, 'a, E, L>
where
    L: Logger,
{
    fn handle_messages(&mut self, time: Time, effects: &mut EffectQueue<'sim, E>) {
        while let Some(Message {
            component_id,
            effect,
        }) = effects.pop_next()
        {
            assert_eq!(component_id.sim_id, self.id);
            let component = &mut self.components[component_id.index];
            let messages = component.receive(effect, EffectContext { time });
            let next_tick = component.next_tick(time);
            self.tick_queue.update(component_id.index, next_tick);
            effects.push_all(messages);
        }
    }

    fn tick_without_messages(
        &mut self,
        component_id: ComponentId<'sim>,
        time: Time,
        effects: &mut EffectQueue<'sim, E>,
    ) {
        let component = &mut self.components[component_id.index];
        let messages = component.tick(EffectContext { time });
        let next_tick = component.next_tick(time);
        self.tick_queue.update(component_id.index, next_tick);
        effects.push_all(messages);
    }

    fn tick(&mut self, component_id: ComponentId<'sim>, time: Time) {
        log!(self.logger, "time = {}", &time);
        self.events += 1;
        let mut effects = EffectQueue::new();
        self.tick_without_messages(component_id, time, &mut effects);
        self.handle_messages(time, &mut effects);
    }

    /// Runs ticks in time order for as long as `predicate` accepts the next tick time.
    pub fn run_while(mut self, mut predicate: impl FnMut(Time) -> bool) -> RunSummary {
        self.components
            .iter()
            .enumerate()
            .for_each(|(idx, component)| {
                self.tick_queue
                    .update(idx, component.next_tick(Time::SIM_START));
            });
        let mut end_time = Time::SIM_START;
        loop {
            match self.tick_queue.next_time() {
                None => {
                    return RunSummary {
                        end_time,
                        events: self.events,
                        exhausted: true,
                    }
                }
                Some(time) if !predicate(time) => {
                    return RunSummary {
                        end_time,
                        events: self.events,
                        exhausted: false,
                    }
                }
                Some(_) => {}
            }
            if let Some((time, idx)) = self.tick_queue.pop_next() {
                end_time = time;
                self.tick(ComponentId::new(idx, self.id), time);
            }
        }
    }

    pub fn run_for(self, timespan: TimeSpan) -> RunSummary {
        let end_time = Time::SIM_START + timespan;
        self.run_while(|time| time < end_time)
    }

    /// Runs until no component has anything left to do.
    pub fn run_to_completion(self) -> RunSummary {
        self.run_while(|_| true)
    }
}
