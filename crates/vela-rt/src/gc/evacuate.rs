//! Evacuation
//!
//! Runs single-threaded on the collector after marking. Pages whose
//! live bytes fall below the configured density keep nothing: every
//! live object is re-placed on a fresh target page and its old
//! header's forward slot records the new handle. Pages that are dense
//! enough (or fully dead) are left alone; the finish phase reclaims
//! the dead ones.
//!
//! Running out of target pages is not an error: evacuation simply
//! stops and the remaining objects stay where they are.

use std::sync::Arc;

use log::debug;

use crate::gc::GcStats;
use crate::heap::{Heap, Page, PAGE_BYTES};
use crate::object::{GcColor, HeapObject};
use crate::value::{Handle, Value};

pub(crate) fn run(heap: &Heap, density_pct: u32, stats: &mut GcStats) {
    let pages = heap.pages_snapshot();
    let mut target: Option<Arc<Page>> = None;
    let mut targets: Vec<u32> = Vec::new();

    for page in &pages {
        if targets.contains(&page.index()) {
            continue;
        }

        let mut live_bytes = 0u32;
        let mut live_count = 0u32;
        page.for_each(|_, obj| {
            if obj.header.color() == GcColor::Black {
                live_bytes += obj.header.size();
                live_count += 1;
            }
        });

        // Fully dead pages are reclaimed by finish; dense pages stay.
        if live_count == 0 || live_bytes * 100 >= PAGE_BYTES * density_pct {
            continue;
        }

        let mut moved = 0u32;
        page.for_each(|_, obj| {
            if obj.header.color() != GcColor::Black || obj.header.forward().is_some() {
                return;
            }
            if place_on_target(heap, &mut target, &mut targets, obj) {
                stats.num_objs_evacuated += 1;
                stats.size_evacuated += obj.header.size();
                moved += 1;
            }
        });

        if moved < live_count {
            // Ran out of target pages; the rest of the heap stays put.
            debug!("evacuation stopped early: {} of {} objects moved", moved, live_count);
            break;
        }
    }
}

/// Place one object on the current target page, rolling to a new page
/// when full. Returns false when no target page can be acquired.
fn place_on_target(
    heap: &Heap,
    target: &mut Option<Arc<Page>>,
    targets: &mut Vec<u32>,
    obj: &Arc<HeapObject>,
) -> bool {
    loop {
        if let Some(page) = target.as_ref() {
            if let Some(handle) = heap.place(page, obj) {
                finish_move(heap, obj, handle);
                return true;
            }
        }
        match heap.acquire_page() {
            Some(page) => {
                targets.push(page.index());
                *target = Some(page);
            }
            None => return false,
        }
    }
}

fn finish_move(heap: &Heap, obj: &Arc<HeapObject>, new_handle: Handle) {
    // The placement accounted the object's bytes a second time; the
    // old copy's share goes away with its page.
    heap.shrink_used(obj.header.size() as usize);
    obj.header.set_forward(Value::from_handle(new_handle));
}
