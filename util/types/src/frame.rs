//! Captured frames, continuation snapshots and the suspend signal.

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::Value;

/// Current continuation snapshot format number.
pub const STATE_FORMAT_VERSION: i32 = 1;

/// Shared, interiorly mutable frame-record handle.
///
/// Links are `Rc` rather than owning boxes because decoded, untrusted chains
/// must be representable (including malformed cyclic ones, which validation
/// rejects) and because the codec preserves reference identity across the
/// slot graph. The runtime itself treats a chain as exclusively owned by the
/// continuation state holding its head.
pub type FrameRef = Rc<RefCell<FrameRecord>>;

/// One captured method activation.
///
/// After a full capture unwind the chain head is the root (outermost) frame:
/// the innermost handler runs first and every outer handler prepends itself.
/// `caller` therefore links from the head toward the innermost frame, and
/// the restore prologue of each re-entered method pops the current head.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// Stable token of the method this frame belongs to.
    pub method_token: i32,
    /// Which yield point within the method execution stopped at.
    pub yield_point_id: i32,
    /// Packed slot values: the original locals, then any spilled
    /// evaluation-stack temporaries.
    pub slots: Vec<Value>,
    /// Next frame in the chain, or `None` for the innermost frame.
    pub caller: Option<FrameRef>,
}

impl FrameRecord {
    pub fn new(
        method_token: i32,
        yield_point_id: i32,
        slots: Vec<Value>,
        caller: Option<FrameRef>,
    ) -> FrameRef {
        Rc::new(RefCell::new(FrameRecord {
            method_token,
            yield_point_id,
            slots,
            caller,
        }))
    }
}

/// A serializable snapshot of a paused computation.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationState {
    /// Snapshot format number; see [`STATE_FORMAT_VERSION`].
    pub version: i32,
    /// Head of the captured frame chain, absent when the computation
    /// suspended without any transformed frame on the stack.
    pub stack_head: Option<FrameRef>,
    /// Value produced by the suspension, `Value::Null` when none.
    pub yielded_value: Value,
}

/// The in-band control object that propagates outward during capture.
///
/// Created once at the suspension site; each transformed catch clause
/// prepends its frame record to `frame_chain` while the signal unwinds; the
/// runner consumes it exactly once. The yield-point id and yielded value are
/// fixed at creation.
#[derive(Debug)]
pub struct SuspendSignal {
    yield_point_id: i32,
    yielded_value: Value,
    frame_chain: RefCell<Option<FrameRef>>,
}

impl SuspendSignal {
    pub fn new(yield_point_id: i32, yielded_value: Value) -> Rc<Self> {
        Rc::new(SuspendSignal {
            yield_point_id,
            yielded_value,
            frame_chain: RefCell::new(None),
        })
    }

    /// Id of the yield point where the suspension originated.
    pub fn yield_point_id(&self) -> i32 {
        self.yield_point_id
    }

    pub fn yielded_value(&self) -> Value {
        self.yielded_value.clone()
    }

    /// Current head of the chain being assembled.
    pub fn frame_chain(&self) -> Option<FrameRef> {
        self.frame_chain.borrow().clone()
    }

    /// Replaces the chain head; capture handlers call this after linking the
    /// previous head as the new record's `caller`.
    pub fn set_frame_chain(&self, head: Option<FrameRef>) {
        *self.frame_chain.borrow_mut() = head;
    }

    /// Builds the serializable snapshot for this suspension. A signal that
    /// escaped without crossing any transformed frame yields a state with no
    /// stack.
    pub fn build_continuation_state(&self) -> ContinuationState {
        ContinuationState {
            version: STATE_FORMAT_VERSION,
            stack_head: self.frame_chain(),
            yielded_value: self.yielded_value(),
        }
    }
}
