//! End-to-end topologies over in-process zones: direct calls, relayed
//! calls, branching route discovery and concurrent reference churn.

mod common;

use std::sync::Arc;

use anyhow::Result;
use codec::{
    PostOptions,
    ids::{MethodId, Zone},
};
use common::{
    Calculator, CalculatorImpl, Directory, DirectoryImpl, chain, encode_i32, make_zone, ordinals,
};
use service::local;

#[test]
fn direct_call_between_two_zones() -> Result<()> {
    let caller = make_zone(1);
    let callee = make_zone(2);
    local::connect(&caller, &callee)?;

    let implementation = Arc::new(CalculatorImpl::default());
    let descriptor = callee.expose(implementation.clone())?;

    let calculator = caller.acquire::<dyn Calculator>(descriptor)?;
    assert_eq!(calculator.square(7)?, 49);
    assert_eq!(implementation.call_count(), 1);

    // The callee carries exactly one reference for the calling zone
    // while the handle lives.
    let stub = callee.find_stub(descriptor.object).unwrap();
    assert_eq!(stub.count_for(Zone::new(1).as_caller()), 1);

    drop(calculator);
    assert_eq!(callee.object_count(), 0);

    Ok(())
}

#[test]
fn relayed_call_across_two_hops() -> Result<()> {
    let zones = chain(&[1, 2, 3])?;
    let (root, middle, leaf) = (&zones[0], &zones[1], &zones[2]);

    // The leaf's calculator is published through a directory in the
    // middle zone, the way any reference reaches a zone it did not
    // originate next to.
    let calculator_descriptor = leaf.expose(Arc::new(CalculatorImpl::default()))?;
    let directory = Arc::new(DirectoryImpl::default());
    directory.set_item(middle.acquire::<dyn Calculator>(calculator_descriptor)?);
    let directory_descriptor = middle.expose(directory)?;

    let listing = root.acquire::<dyn Directory>(directory_descriptor)?;
    let calculator = listing.get()?;

    // The root found the leaf through the middle zone: its new route
    // rides the same channel as its route to the middle.
    let route = root.peer(Zone::new(3).as_destination()).unwrap();
    assert_eq!(route.via(), Zone::new(2));

    assert_eq!(calculator.square(6)?, 36);

    let stub = leaf.find_stub(calculator_descriptor.object).unwrap();
    assert!(stub.count_for(Zone::new(1).as_caller()) >= 1);

    // Dropping the root's handle returns every reference it held, and
    // the routed peer entry goes with the last one.
    drop(calculator);
    assert_eq!(stub.count_for(Zone::new(1).as_caller()), 0);
    assert!(root.peer(Zone::new(3).as_destination()).is_none());

    Ok(())
}

/// The branching topology: a deep chain builds a fork the root has
/// never heard of, and an object from the far prong travels all the way
/// back. Every zone along the return path must extend its route table
/// from the direction hint, without recursing into the channel the
/// reference arrived through.
#[test]
fn branching_fork_reaches_the_root() -> Result<()> {
    // Chain: 1 - 2 - 3 - 4 - 5, fork: 3 - 6 - 7.
    let zones = chain(&[1, 2, 3, 4, 5])?;
    let (root, z2, z3, z4, z5) = (&zones[0], &zones[1], &zones[2], &zones[3], &zones[4]);
    let z6 = make_zone(6);
    let z7 = make_zone(7);
    local::connect(z3, &z6)?;
    local::connect(&z6, &z7)?;

    // The fork publishes a calculator living in zone 7; zone 3 fetches
    // it through zone 6.
    let calculator_descriptor = z7.expose(Arc::new(CalculatorImpl::default()))?;
    let fork_directory = Arc::new(DirectoryImpl::default());
    fork_directory.set_item(z6.acquire::<dyn Calculator>(calculator_descriptor)?);
    let fork_descriptor = z6.expose(fork_directory)?;
    let fork = z3.acquire::<dyn Directory>(fork_descriptor)?;
    let calculator_at_3 = fork.get()?;

    // Directories wire the chain downwards: the root can walk from its
    // neighbour all the way to zone 5.
    let d5 = Arc::new(DirectoryImpl::default());
    let d5_descriptor = z5.expose(d5)?;
    let d4 = Arc::new(DirectoryImpl::default());
    d4.set_delegate(z4.acquire::<dyn Directory>(d5_descriptor)?);
    let d4_descriptor = z4.expose(d4)?;
    let d3 = Arc::new(DirectoryImpl::default());
    d3.set_delegate(z3.acquire::<dyn Directory>(d4_descriptor)?);
    let d3_descriptor = z3.expose(d3)?;
    let d2 = Arc::new(DirectoryImpl::default());
    d2.set_delegate(z2.acquire::<dyn Directory>(d3_descriptor)?);
    let d2_descriptor = z2.expose(d2)?;

    // Zone 3 pushes the fork's calculator into zone 5's directory. The
    // reference crosses zones 4 and 5, which have never heard of zone
    // 7 either.
    {
        let d4_at_3 = z3.acquire::<dyn Directory>(d4_descriptor)?;
        let d5_at_3 = d4_at_3.delegate()?;
        d5_at_3.put(calculator_at_3.clone())?;
    }

    // The root walks the chain and pulls the calculator out of zone 5.
    let walk2 = root.acquire::<dyn Directory>(d2_descriptor)?;
    let walk3 = walk2.delegate()?;
    let walk4 = walk3.delegate()?;
    let walk5 = walk4.delegate()?;
    let calculator = walk5.get()?;

    // The root reaches zone 7 over the same channel as everything else
    // it knows, and the call crosses 1 - 2 - 3 - 6 - 7 without loops.
    let to_fork = root.peer(Zone::new(7).as_destination()).unwrap();
    let to_z3 = root.peer(Zone::new(3).as_destination()).unwrap();
    assert_eq!(to_fork.via(), to_z3.via());
    assert_eq!(calculator.square(9)?, 81);

    // The relay in zone 2 extended its own table for the fork.
    assert!(z2.peer(Zone::new(7).as_destination()).is_some());

    // Returning the root's references leaves the fork's counters to
    // the holders that remain.
    let stub = z7.find_stub(calculator_descriptor.object).unwrap();
    assert!(stub.count_for(Zone::new(1).as_caller()) >= 1);
    drop(calculator);
    assert_eq!(stub.count_for(Zone::new(1).as_caller()), 0);

    Ok(())
}

#[test]
fn application_errors_pass_through_verbatim() -> Result<()> {
    let caller = make_zone(1);
    let callee = make_zone(2);
    local::connect(&caller, &callee)?;

    // An empty directory reports its own application error code, which
    // crosses the zone boundary untouched.
    let descriptor = callee.expose(Arc::new(DirectoryImpl::default()))?;
    let directory = caller.acquire::<dyn Directory>(descriptor)?;

    assert_eq!(
        directory.get().err(),
        Some(codec::error::Error::Application(100))
    );

    Ok(())
}

#[test]
fn posts_are_fire_and_forget() -> Result<()> {
    let zones = chain(&[1, 2, 3])?;
    let (root, middle, leaf) = (&zones[0], &zones[1], &zones[2]);

    let implementation = Arc::new(CalculatorImpl::default());
    let calculator_descriptor = leaf.expose(implementation.clone())?;
    let directory = Arc::new(DirectoryImpl::default());
    directory.set_item(middle.acquire::<dyn Calculator>(calculator_descriptor)?);
    let directory_descriptor = middle.expose(directory)?;

    let listing = root.acquire::<dyn Directory>(directory_descriptor)?;
    let calculator = listing.get()?;

    // A one-way invocation is routed like a call but produces no reply;
    // the callee still executes it.
    let proxy = calculator.object_proxy().unwrap();
    proxy.post(
        ordinals().calculator,
        MethodId::new(1),
        PostOptions::NORMAL,
        &|encoding| encode_i32(encoding, 5),
    )?;

    assert_eq!(implementation.call_count(), 1);
    Ok(())
}

#[test]
fn concurrent_reference_churn_stays_balanced() -> Result<()> {
    let caller = make_zone(1);
    let callee = make_zone(2);
    local::connect(&caller, &callee)?;

    let descriptor = callee.expose(Arc::new(CalculatorImpl::default()))?;

    // An anchoring reference keeps the stub alive while worker threads
    // take and drop their own.
    let anchor = caller.acquire::<dyn Calculator>(descriptor)?;
    let anchor_proxy = anchor.object_proxy().unwrap();

    let workers: Vec<_> = (0..16)
        .map(|_| {
            let caller = caller.clone();
            let anchor_proxy = anchor_proxy.clone();
            std::thread::spawn(move || -> Result<()> {
                for _ in 0..64 {
                    let handle = caller.acquire::<dyn Calculator>(descriptor)?;

                    // Every concurrent holder shares the single proxy.
                    let proxy = handle.object_proxy().unwrap();
                    assert!(Arc::ptr_eq(&proxy, &anchor_proxy));
                    assert_eq!(handle.square(3)?, 9);
                }

                Ok(())
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap()?;
    }

    // Every acquisition granted one wire reference on the shared
    // proxy; they all come back in one burst when the proxy dies, and
    // the callee ends at zero.
    let stub = callee.find_stub(descriptor.object).unwrap();
    assert_eq!(stub.count_for(Zone::new(1).as_caller()), 1 + 16 * 64);
    assert_eq!(anchor_proxy.grants(), 1 + 16 * 64);

    drop((anchor, anchor_proxy));
    assert_eq!(stub.total_count(), 0);
    assert_eq!(callee.object_count(), 0);

    Ok(())
}
