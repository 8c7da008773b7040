//! Walks through a few allocations and prints the block chain after each
//! step, the way a debugging session would.

use memheap::{Heap, HeapError};

fn dump(heap: &Heap, step: &str) {
    println!("--- {step} ({} regions)", heap.regions_mapped());

    for block in heap.blocks() {
        println!(
            "{:#014x} cap {:>8} {} next {:?}",
            block.addr,
            block.capacity,
            if block.is_free { "free " } else { "taken" },
            block.next.map(|next| format!("{next:#x}")),
        );
    }
}

fn main() -> Result<(), HeapError> {
    let mut heap = Heap::new()?;
    println!("Heap starts at {:?}", heap.base());
    dump(&heap, "init");

    let a = heap.acquire(8)?;
    let b = heap.acquire(8)?;
    println!("Requested 8 bytes twice, received {a:?} and {b:?}");
    dump(&heap, "two small blocks");

    heap.release(a.as_ptr())?;
    heap.release(b.as_ptr())?;
    dump(&heap, "both released");

    let big = heap.acquire(8192)?;
    let huge = heap.acquire(131072)?;
    println!("Requested 8192 and 131072 bytes, received {big:?} and {huge:?}");
    dump(&heap, "grown");

    heap.release(big.as_ptr())?;
    heap.release(huge.as_ptr())?;
    dump(&heap, "all released");

    if let Err(err) = heap.release(huge.as_ptr()) {
        println!("Releasing twice is refused: {err}");
    }

    Ok(())
}
