use crate::request::{Extra, Request};
use slab::Slab;

/// Caller-visible identity of a queued request.
///
/// A generation-checked slab key: `(generation << 32) | index`. The same
/// value travels through the ring as the entry's user data, so a completion
/// for a request whose slot has since been reused can never be attributed to
/// the new occupant. Carries no ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RequestHandle(u64);

impl RequestHandle {
    /// Handle returned for requests that completed synchronously. Never refers
    /// to a queued request.
    pub const INVALID: RequestHandle = RequestHandle(0);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    fn new(index: usize, generation: u32) -> Self {
        debug_assert!(generation != 0, "generation 0 is reserved for INVALID");
        debug_assert!(index <= u32::MAX as usize);
        Self((u64::from(generation) << 32) | index as u64)
    }

    pub(crate) fn from_user_data(user_data: u64) -> Self {
        Self(user_data)
    }

    pub(crate) fn user_data(&self) -> u64 {
        self.0
    }

    fn index(&self) -> usize {
        (self.0 & u64::from(u32::MAX)) as usize
    }

    fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// A request accepted by the engine plus the bookkeeping the engine keeps
/// about it.
pub(crate) struct PendingRequest {
    pub(crate) request: Request,

    /// Lazily allocated per-operation state, see [`Extra`].
    pub(crate) extra: Option<Extra>,

    /// Whether the ring currently owns an entry for this request.
    pub(crate) submitted: bool,
}

impl PendingRequest {
    pub(crate) fn new(request: Request) -> Self {
        Self {
            request,
            extra: None,
            submitted: false,
        }
    }

    pub(crate) fn is_split(&self) -> bool {
        self.extra.as_ref().is_some_and(Extra::is_split)
    }
}

struct Node {
    entry: PendingRequest,
    generation: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Ordered list of every request between being queued and its callback
/// firing.
///
/// Nodes live in a slab and are linked by index, giving O(1) lookup, removal
/// and splicing by handle. A submission cursor marks the first request not
/// yet handed to the ring: every node from the cursor to the tail is
/// unsubmitted. The cursor is either a live node or unset, which means
/// "everything has been submitted".
pub(crate) struct PendingQueue {
    nodes: Slab<Node>,
    head: Option<usize>,
    tail: Option<usize>,
    cursor: Option<usize>,
    next_generation: u32,
}

impl PendingQueue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Slab::with_capacity(capacity),
            head: None,
            tail: None,
            cursor: None,
            next_generation: 1,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Appends at the tail. If nothing was waiting for submission, the new
    /// request becomes the cursor.
    pub(crate) fn push_back(&mut self, entry: PendingRequest) -> RequestHandle {
        let generation = self.next_generation;
        self.next_generation = match generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };

        let index = self.nodes.insert(Node {
            entry,
            generation,
            prev: None,
            next: None,
        });
        self.link_before(index, None);

        if self.cursor.is_none() {
            self.cursor = Some(index);
        }

        RequestHandle::new(index, generation)
    }

    pub(crate) fn contains(&self, handle: RequestHandle) -> bool {
        self.node_index(handle).is_some()
    }

    pub(crate) fn get(&self, handle: RequestHandle) -> Option<&PendingRequest> {
        self.node_index(handle).map(|index| &self.nodes[index].entry)
    }

    pub(crate) fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut PendingRequest> {
        self.node_index(handle)
            .map(move |index| &mut self.nodes[index].entry)
    }

    /// Lookup for handles the engine knows to be queued.
    #[track_caller]
    pub(crate) fn expect_mut(&mut self, handle: RequestHandle) -> &mut PendingRequest {
        match self.get_mut(handle) {
            Some(entry) => entry,
            None => panic!("request {handle:?} is not in the pending queue"),
        }
    }

    /// First request not yet handed to the ring.
    pub(crate) fn cursor(&self) -> Option<RequestHandle> {
        self.cursor
            .map(|index| RequestHandle::new(index, self.nodes[index].generation))
    }

    pub(crate) fn advance_cursor(&mut self) {
        self.cursor = self.cursor.and_then(|index| self.nodes[index].next);
    }

    /// Moves `handle` right in front of the cursor (or to the tail when the
    /// cursor is unset) and makes it the cursor, so it is the next request
    /// prepared for submission.
    pub(crate) fn move_before_cursor(&mut self, handle: RequestHandle) {
        let Some(index) = self.node_index(handle) else {
            return;
        };

        if self.cursor == Some(index) {
            return;
        }

        self.unlink(index);
        self.link_before(index, self.cursor);
        self.cursor = Some(index);
    }

    /// Erases the request. Removing the cursor moves it to the next node.
    pub(crate) fn remove(&mut self, handle: RequestHandle) -> Option<PendingRequest> {
        let index = self.node_index(handle)?;

        if self.cursor == Some(index) {
            self.cursor = self.nodes[index].next;
        }

        self.unlink(index);
        Some(self.nodes.remove(index).entry)
    }

    /// Handles of every queued request, in queue order.
    pub(crate) fn handles(&self) -> Vec<RequestHandle> {
        let mut handles = Vec::with_capacity(self.len());
        let mut current = self.head;

        while let Some(index) = current {
            let node = &self.nodes[index];
            handles.push(RequestHandle::new(index, node.generation));
            current = node.next;
        }

        handles
    }

    fn node_index(&self, handle: RequestHandle) -> Option<usize> {
        let index = handle.index();
        self.nodes
            .get(index)
            .filter(|node| node.generation == handle.generation())
            .map(|_| index)
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let node = &mut self.nodes[index];
            (node.prev.take(), node.next.take())
        };

        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }

        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
    }

    // Links a detached node in front of `at`, or at the tail for `None`.
    fn link_before(&mut self, index: usize, at: Option<usize>) {
        let prev = match at {
            Some(at) => self.nodes[at].prev,
            None => self.tail,
        };

        {
            let node = &mut self.nodes[index];
            node.prev = prev;
            node.next = at;
        }

        match prev {
            Some(prev) => self.nodes[prev].next = Some(index),
            None => self.head = Some(index),
        }

        match at {
            Some(at) => self.nodes[at].prev = Some(index),
            None => self.tail = Some(index),
        }
    }
}
