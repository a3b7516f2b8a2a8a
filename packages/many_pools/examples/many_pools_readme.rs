//! Partitions a simulated four-PU machine into a default pool and a dedicated I/O pool,
//! then prints the finalized worker layout.

use many_pools::fake::TopologyBuilder;
use many_pools::{MapConfig, Partitioner, PartitionerMode, SchedulingPolicy, TopologyFacade};
use new_zealand::nz;

fn main() {
    let topology =
        TopologyFacade::from_fake(TopologyBuilder::uniform(nz!(1), nz!(4), nz!(1)).build());
    let config = MapConfig::new().with("hpx.os_threads", "4");

    let partitioner = Partitioner::new(PartitionerMode::DEFAULT, &config, topology)
        .expect("this process creates exactly one partitioner");

    partitioner
        .create_thread_pool("io", SchedulingPolicy::LocalPriorityFifo, None, None)
        .expect("pool name is non-empty and unused");

    let domains = partitioner.numa_domains();
    partitioner
        .add_resource(&domains[0].cores()[0].pus()[0], "io", true, 1)
        .expect("PU 0 is exposed and unbound");

    partitioner
        .configure_pools()
        .expect("every pool has resources and the budget is respected");

    for worker in 0..partitioner.num_threads() {
        println!(
            "worker {worker} runs on PU {} with mask {}",
            partitioner.pu_num(worker),
            partitioner.pu_mask(worker)
        );
    }

    print!("{}", partitioner.format_pools());
}
