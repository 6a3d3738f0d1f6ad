use abyss::cpu::isa::INSTRUCTION_SIZE;
use abyss::interrupt::{Vector, PFERR_PRESENT, PFERR_USER, PFERR_WRITE};
use keos::addressing::{Pa, PAGE_SIZE};
use keos::check::check_virtual_memory;
use keos::layout::{va, CONSOLE_ADDR, MEMSIZE_VIRTUAL, NPROC};
use keos::process::{Pid, ProcState};
use keos::{Kernel, Stop};
use rand::Rng;
use weensyos::programs::{heap_addr, text_addr};
use weensyos::Programs;

fn boot(command: Option<&str>) -> Kernel<Programs> {
    Kernel::boot(Programs, command)
}

fn run_ticks(kernel: &mut Kernel<Programs>, ticks: usize) -> Stop {
    let until = kernel.ticks() + ticks;
    kernel.run_until(|k| k.ticks() >= until)
}

fn check(kernel: &Kernel<Programs>) {
    check_virtual_memory(kernel.mm(), kernel.kernel_pagetable(), kernel.procs());
}

fn pa_of(kernel: &Kernel<Programs>, pid: Pid, addr: usize) -> Option<Pa> {
    kernel.procs()[pid]
        .pagetable
        .as_ref()?
        .walk(kernel.mm(), va(addr))
        .ok()?
        .pa()
}

fn read_u64(kernel: &Kernel<Programs>, pid: Pid, addr: usize) -> Option<u64> {
    let mut buf = [0u8; 8];
    kernel
        .read_user(pid, addr, &mut buf)
        .then(|| u64::from_le_bytes(buf))
}

fn live(kernel: &Kernel<Programs>) -> Vec<Pid> {
    kernel.procs().live().map(|p| p.pid).collect()
}

#[test]
fn allocators_get_zeroed_private_pages() {
    let mut kernel = boot(None);
    assert_eq!(run_ticks(&mut kernel, 20), Stop::Condition);
    check(&kernel);

    for pid in 1..=4 {
        let heap = heap_addr(text_addr(pid - 1));
        assert_eq!(read_u64(&kernel, pid, heap), Some(pid as u64));
        // The rest of the page reads back zero.
        let mut rest = vec![0xffu8; PAGE_SIZE - 8];
        assert!(kernel.read_user(pid, heap + 8, &mut rest));
        assert!(rest.iter().all(|b| *b == 0));
    }
    let heaps: Vec<Pa> = (1..=4)
        .map(|pid| pa_of(&kernel, pid, heap_addr(text_addr(pid - 1))).unwrap())
        .collect();
    for (i, a) in heaps.iter().enumerate() {
        assert_eq!(kernel.mm().refcount(*a), 1);
        assert!(!heaps[i + 1..].contains(a));
    }
}

#[test]
fn allocators_fill_memory_without_breaking() {
    let mut kernel = boot(None);
    run_ticks(&mut kernel, 100);
    check(&kernel);
    assert_eq!(kernel.mm().free_pages(), 0);
    assert_eq!(live(&kernel), [1, 2, 3, 4]);
    assert!(kernel
        .procs()
        .live()
        .all(|p| p.state == ProcState::Runnable));
}

#[test]
fn fork_copies_writable_and_shares_text() {
    let mut kernel = boot(Some("fork"));
    run_ticks(&mut kernel, 20);
    check(&kernel);
    let pids = live(&kernel);
    assert_eq!(pids.len(), 4);

    let text = text_addr(0);
    let text_pa = pa_of(&kernel, 1, text).unwrap();
    for pid in pids.iter() {
        assert_eq!(pa_of(&kernel, *pid, text), Some(text_pa));
    }
    assert_eq!(kernel.mm().refcount(text_pa), pids.len() as u32);

    let heap = heap_addr(text);
    let mut seen = Vec::new();
    for pid in pids.iter() {
        let pa = pa_of(&kernel, *pid, heap).unwrap();
        assert!(!seen.contains(&pa));
        seen.push(pa);
        // Each process wrote its own pid after the fork.
        assert_eq!(read_u64(&kernel, *pid, heap), Some(*pid as u64));
    }

    // The console was copied on fork.
    let consoles: Vec<Pa> = pids
        .iter()
        .map(|pid| pa_of(&kernel, *pid, CONSOLE_ADDR).unwrap())
        .collect();
    assert_eq!(consoles[0].into_usize(), CONSOLE_ADDR);
    assert!(consoles[1..]
        .iter()
        .all(|pa| pa.into_usize() != CONSOLE_ADDR));
}

#[test]
fn null_deref_breaks_only_the_faulting_process() {
    let mut kernel = boot(Some("null_deref"));
    kernel.process_setup(2, "allocator2");
    assert_eq!(run_ticks(&mut kernel, 10), Stop::Condition);
    assert_eq!(kernel.procs()[1].state, ProcState::Broken);
    assert_eq!(kernel.procs()[2].state, ProcState::Runnable);
    assert_eq!(
        read_u64(&kernel, 2, heap_addr(text_addr(1))),
        Some(2)
    );
    // Broken processes keep their memory.
    assert!(kernel.procs()[1].pagetable.is_some());
    check(&kernel);
}

#[test]
fn text_is_read_only() {
    let mut kernel = boot(Some("text_write"));
    assert_eq!(run_ticks(&mut kernel, 10), Stop::Idle);
    let proc = &kernel.procs()[1];
    assert_eq!(proc.state, ProcState::Broken);
    assert_eq!(proc.regs.vector, Vector::PageFault as u8);
    assert_eq!(proc.regs.error_code, PFERR_PRESENT | PFERR_WRITE | PFERR_USER);
    assert_eq!(proc.regs.rip, text_addr(0) + 2 * INSTRUCTION_SIZE);
}

#[test]
fn forkexit_reclaims_everything() {
    let mut kernel = boot(Some("forkexit"));
    let before = kernel.mm().free_pages();
    for _ in 0..20 {
        run_ticks(&mut kernel, 10);
        check(&kernel);
    }
    assert_eq!(kernel.procs()[1].state, ProcState::Runnable);
    // Pages in use are accounted for by the processes alive now.
    let in_use: usize = live(&kernel)
        .into_iter()
        .filter(|pid| *pid != 1)
        .map(|pid| {
            let pt = kernel.procs()[pid].pagetable.as_ref().unwrap();
            pt.table_pages(kernel.mm()).len()
                + pt
                    .mappings(kernel.mm(), 0..MEMSIZE_VIRTUAL)
                    .iter()
                    .filter(|(_, pte)| {
                        pte.pa()
                            .map_or(false, |pa| kernel.mm().refcount(pa) == 1)
                    })
                    .count()
        })
        .sum();
    assert_eq!(kernel.mm().free_pages() + in_use, before);
}

#[test]
fn forkbomb_fills_the_process_table() {
    let mut kernel = boot(Some("forkbomb"));
    run_ticks(&mut kernel, 50);
    check(&kernel);
    assert_eq!(live(&kernel).len(), NPROC - 1);
    assert_eq!(kernel.procs().first_free(), None);
    assert!(kernel
        .procs()
        .live()
        .all(|p| p.state == ProcState::Runnable));
}

#[test]
fn console_is_private_after_page_alloc() {
    let mut kernel = boot(Some("console"));
    run_ticks(&mut kernel, 5);
    check(&kernel);
    let pa = pa_of(&kernel, 1, CONSOLE_ADDR).unwrap();
    assert_ne!(pa.into_usize(), CONSOLE_ADDR);
    assert_eq!(read_u64(&kernel, 1, CONSOLE_ADDR), Some(0));
    assert_eq!(read_u64(&kernel, 1, CONSOLE_ADDR + 8), Some(1));
    // The shared console got the first write.
    assert_eq!(kernel.mm().memory().read_u64(Pa::new(CONSOLE_ADDR).unwrap()), 1);
}

#[test]
fn random_schedules_keep_refcounts_exact() {
    let mut rng = rand::thread_rng();
    for _ in 0..4 {
        let command = ["fork", "forkexit", "forkbomb", "allocator3"][rng.gen_range(0..4)];
        let mut kernel = boot(Some(command));
        for _ in 0..rng.gen_range(1..6) {
            run_ticks(&mut kernel, rng.gen_range(1..40));
            check(&kernel);
        }
    }
}
