//! TLB layer benchmarks

use core::hint::black_box;
use criterion::{Criterion, criterion_group, criterion_main};

use kvx_mmu::{
    CachePolicy, EntryStatus, FlushRequest, Global, MmuConfig, MmuSystem, PageSize, Protection,
    Pte, PteFlags, TlbEntry,
};

fn user_pte(pfn: u64) -> Pte {
    Pte::new(
        pfn,
        PteFlags::PRESENT | PteFlags::READ | PteFlags::WRITE,
        PageSize::Size4K,
        CachePolicy::WriteThroughCached,
    )
}

fn bench_entry_encode(c: &mut Criterion) {
    c.bench_function("tlb_entry_new", |b| {
        b.iter(|| {
            TlbEntry::new(
                black_box(0x8000_2000),
                black_box(0x1000),
                PageSize::Size4K,
                Global::UseAsn,
                Protection::RwRw,
                CachePolicy::WriteThroughCached,
                black_box(7),
                EntryStatus::AccessedModified,
            )
        })
    });
}

fn bench_refill(c: &mut Criterion) {
    let Ok(mmu) = MmuSystem::simulated(MmuConfig::with_cpus(1)) else {
        return;
    };
    let mm = mmu.init_new_context();
    let _ = mmu.switch_mm(0, &mm);
    let mut page = 0u64;

    c.bench_function("update_mmu_cache", |b| {
        b.iter(|| {
            page = (page + 1) & 0xfff;
            let mut pte = user_pte(page);
            black_box(mmu.update_mmu_cache(0, &mm, page << 12, &mut pte))
        })
    });
}

fn bench_flush(c: &mut Criterion) {
    let Ok(mmu) = MmuSystem::simulated(MmuConfig::with_cpus(1)) else {
        return;
    };
    let mm = mmu.init_new_context();
    let _ = mmu.switch_mm(0, &mm);
    for page in 0..256 {
        let _ = mmu.update_mmu_cache(0, &mm, page << 12, &mut user_pte(page));
    }

    c.bench_function("local_flush_tlb_page", |b| {
        b.iter(|| black_box(mmu.local_flush_tlb_page(0, &mm, black_box(0x4000))))
    });

    c.bench_function("local_flush_tlb_all", |b| {
        b.iter(|| black_box(mmu.local_flush_tlb_all(0)))
    });

    c.bench_function("smp_flush_range_16_pages", |b| {
        b.iter(|| {
            black_box(mmu.smp_flush(
                0,
                FlushRequest::Range {
                    mm: mm.clone(),
                    start: 0,
                    end: 16 << 12,
                },
            ))
        })
    });
}

criterion_group!(tlb_benchmarks, bench_entry_encode, bench_refill, bench_flush);

criterion_main!(tlb_benchmarks);
