use std::{
    alloc::{alloc, handle_alloc_error, Layout},
    cell::{Cell, UnsafeCell},
    mem::MaybeUninit,
    ptr::NonNull,
};

use log::trace;

/// Strong and weak counts shared by every handle attached to one record.
///
/// Every strong owner is simultaneously counted as a weak observer, so
/// `strong <= weak` holds at all times. A record is only ever created
/// together with its first strong owner, hence counts start at 1/1.
pub(crate) struct Counts {
    strong: Cell<usize>,
    weak: Cell<usize>,
}

impl Counts {
    fn new() -> Self {
        Counts {
            strong: Cell::new(1),
            weak: Cell::new(1),
        }
    }

    pub(crate) fn strong(&self) -> usize {
        self.strong.get()
    }

    pub(crate) fn weak(&self) -> usize {
        self.weak.get()
    }

    fn add_strong(&self) {
        self.strong.set(self.strong.get() + 1);
        self.weak.set(self.weak.get() + 1);
    }

    fn dec_strong(&self) {
        debug_assert!(self.strong.get() > 0);
        self.strong.set(self.strong.get() - 1);
    }

    fn add_weak(&self) {
        self.weak.set(self.weak.get() + 1);
    }

    fn dec_weak(&self) {
        debug_assert!(self.weak.get() > 0);
        self.weak.set(self.weak.get() - 1);
    }
}

/// A bookkeeping record. Handles only ever see `dyn Record`, so they stay
/// independent of how the value was allocated and how it must be destroyed.
pub(crate) trait Record {
    fn counts(&self) -> &Counts;

    /// Destroys the managed value. Called exactly once, by the strong
    /// release that takes the strong count to zero.
    ///
    /// # Safety
    ///
    /// The managed value must still be alive.
    unsafe fn destroy_value(&self);
}

pub(crate) type RecordPtr = NonNull<dyn Record>;

/// Reads the record's strong count.
///
/// # Safety
///
/// `record` must point to a live record.
pub(crate) unsafe fn strong_count(record: RecordPtr) -> usize {
    unsafe { record.as_ref() }.counts().strong()
}

/// Reads the record's weak count.
///
/// # Safety
///
/// `record` must point to a live record.
pub(crate) unsafe fn weak_count(record: RecordPtr) -> usize {
    unsafe { record.as_ref() }.counts().weak()
}

/// Registers one more strong owner, which is also one more weak observer.
///
/// # Safety
///
/// `record` must point to a live record.
pub(crate) unsafe fn retain_strong(record: RecordPtr) {
    unsafe { record.as_ref() }.counts().add_strong();
}

/// Registers one more weak observer.
///
/// # Safety
///
/// `record` must point to a live record.
pub(crate) unsafe fn retain_weak(record: RecordPtr) {
    unsafe { record.as_ref() }.counts().add_weak();
}

/// Drops one strong owner, destroying the value if it was the last one.
///
/// The owner's weak unit is released only after `destroy_value` returns.
/// While the value's own drop code runs, that unit still pins the record,
/// so releases performed from inside the drop cannot free it under us.
///
/// # Safety
///
/// `record` must point to a live record holding a strong count this caller
/// is entitled to release.
pub(crate) unsafe fn release_strong(record: RecordPtr) {
    let counts = unsafe { record.as_ref() }.counts();
    counts.dec_strong();
    if counts.strong() == 0 {
        trace!("record {:p}: destroying value", record);
        unsafe { record.as_ref().destroy_value() };
    }
    unsafe { release_weak(record) };
}

/// Drops one weak observer, freeing the record if it was the last one.
///
/// # Safety
///
/// `record` must point to a live record holding a weak count this caller is
/// entitled to release.
pub(crate) unsafe fn release_weak(record: RecordPtr) {
    let counts = unsafe { record.as_ref() }.counts();
    counts.dec_weak();
    if counts.weak() == 0 {
        trace!("record {:p}: freeing", record);
        // The trait object carries the concrete layout, so this frees the
        // record no matter which variant it is. The value was destroyed when
        // the strong count hit zero; neither variant drops it again.
        drop(unsafe { Box::from_raw(record.as_ptr()) });
    }
}

/// Record for a value living in its own, separate allocation. Destroying the
/// value hands the stored address to the destroy action.
struct ExternalRecord<T, D>
where
    D: FnOnce(*mut T),
{
    counts: Counts,
    ptr: *mut T,
    destroy: Cell<Option<D>>,
}

impl<T, D> Record for ExternalRecord<T, D>
where
    D: FnOnce(*mut T),
{
    fn counts(&self) -> &Counts {
        &self.counts
    }

    unsafe fn destroy_value(&self) {
        let destroy = self.destroy.take();
        debug_assert!(destroy.is_some());
        if let Some(destroy) = destroy {
            destroy(self.ptr);
        }
    }
}

/// Record embedding storage for the value itself, so owning a freshly
/// constructed value costs a single allocation. Destroying the value drops
/// it in place; the storage is freed only with the record.
struct InlineRecord<T> {
    counts: Counts,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Record for InlineRecord<T> {
    fn counts(&self) -> &Counts {
        &self.counts
    }

    unsafe fn destroy_value(&self) {
        unsafe { (*self.value.get()).assume_init_drop() };
    }
}

/// Allocates a record for an externally allocated value.
///
/// If the record allocation itself fails, `destroy` is applied to `ptr`
/// before the failure escalates, so the caller's address is never leaked
/// even though ownership was never established.
pub(crate) fn new_external<T, D>(ptr: *mut T, destroy: D) -> RecordPtr
where
    T: 'static,
    D: FnOnce(*mut T) + 'static,
{
    let layout = Layout::new::<ExternalRecord<T, D>>();
    let mem = unsafe { alloc(layout) }.cast::<ExternalRecord<T, D>>();
    let Some(mem) = NonNull::new(mem) else {
        destroy(ptr);
        handle_alloc_error(layout);
    };

    unsafe {
        mem.as_ptr().write(ExternalRecord {
            counts: Counts::new(),
            ptr,
            destroy: Cell::new(Some(destroy)),
        });
    }
    trace!("record {:p}: adopted external value {:p}", mem, ptr);
    mem
}

/// Allocates a record with the value constructed in place inside it.
///
/// `init` runs after the record is allocated. If it panics, the box is
/// dropped as-is: the allocation is unwound, no value exists yet, and no
/// destroy runs. The record has been handed to no handle at that point.
pub(crate) fn new_inline<T, F>(init: F) -> (RecordPtr, NonNull<T>)
where
    T: 'static,
    F: FnOnce() -> T,
{
    let mut record = Box::new(InlineRecord {
        counts: Counts::new(),
        value: UnsafeCell::new(MaybeUninit::uninit()),
    });
    record.value.get_mut().write(init());

    let record = Box::leak(record);
    let value = unsafe { NonNull::new_unchecked(record.value.get().cast::<T>()) };
    let record: RecordPtr = NonNull::from(record);
    trace!("record {:p}: emplaced value {:p}", record, value);
    (record, value)
}
