use crate::*;

use bytes::Bytes;

// ══════════════════════════════════════════════════════════════════════════════
//  Membership changes on a running bus
// ══════════════════════════════════════════════════════════════════════════════

/// Pulling a node out of the middle of the ring: its predecessor's
/// give-token goes unanswered, and the warm boot that follows drops the
/// node from every roster.
#[test]
fn test_detached_node_leaves_ring() -> Result<()> {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    cluster.converge()?;

    cluster.detach(1);
    let reached = cluster.converge()?;
    println!("ring closed around the gap at {reached} ms");

    for node in cluster.live() {
        assert!(
            !node.mac.roster().contains(&addr(2)),
            "{} still lists the detached node",
            node.mac.identity().address
        );
    }
    Ok(())
}

/// Losing the most dominant node moves the membership refresh to the next
/// one, which must still admit newcomers.
#[test]
fn test_dominant_node_loss_hands_over_refresh() -> Result<()> {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    cluster.converge()?;

    cluster.detach(0);
    cluster.converge()?;
    assert_eq!(cluster.live_addresses(), vec![addr(2), addr(3)]);

    cluster.add(4);
    cluster.converge()?;
    assert_eq!(cluster.live_addresses(), vec![addr(2), addr(3), addr(4)]);
    Ok(())
}

/// A node powered up on a busy bus never hears silence, so it waits for the
/// periodic membership refresh to be admitted.
#[test]
fn test_late_joiner_is_admitted() -> Result<()> {
    let mut cluster = Cluster::new(&[1, 2]);
    cluster.converge()?;

    let joiner = cluster.add(3);
    let reached = cluster.converge()?;
    println!("late joiner admitted at {reached} ms");

    cluster.nodes[joiner]
        .mac
        .submit_parcel(addr(1), Bytes::from_static(b"hi, i'm new"))?;
    cluster.run_until(5_000, |c| !c.nodes[0].delivered.is_empty())?;
    assert_eq!(cluster.nodes[0].delivered[0].peer, addr(3));
    Ok(())
}
