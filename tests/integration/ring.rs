use crate::*;

use bytes::Bytes;
use ezbus_mac::Port;

// ══════════════════════════════════════════════════════════════════════════════
//  Ring formation and token circulation
// ══════════════════════════════════════════════════════════════════════════════

/// A node alone on the bus boots through silence, wins the cold boot contest
/// unopposed and then keeps the token without sending anything.
#[test]
fn test_lone_node_takes_token() -> Result<()> {
    let mut cluster = Cluster::new(&[5]);
    let reached = cluster.run_until(10_000, |c| c.holders() == vec![0])?;
    println!("lone node holds the token after {reached} ms");
    assert!(cluster.converged());

    let frames = cluster.bus.frames_sent();
    cluster.run_for(2_000)?;
    assert!(cluster.nodes[0].mac.token_held(), "lone node dropped the token");
    assert_eq!(cluster.bus.frames_sent(), frames, "lone node kept transmitting");
    Ok(())
}

/// Three nodes powered up together agree on one ring and every node gets
/// the token in turn.
#[test]
fn test_three_nodes_form_one_ring() -> Result<()> {
    let mut cluster = Cluster::new(&[7, 3, 9]);
    let reached = cluster.converge()?;
    println!("ring of three formed after {reached} ms");

    let mut visited = [false; 3];
    for _ in 0..1_000 {
        let before: Vec<_> = cluster.nodes.iter().map(|n| n.mac.last_token()).collect();
        cluster.step()?;
        for (i, node) in cluster.nodes.iter().enumerate() {
            if node.mac.last_token() != before[i] {
                visited[i] = true;
            }
        }
    }
    assert_eq!(visited, [true; 3], "token did not visit every node");
    Ok(())
}

#[test]
fn test_parcel_delivered_across_ring() -> Result<()> {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    cluster.converge()?;

    cluster.nodes[2]
        .mac
        .submit_parcel(addr(1), Bytes::from_static(b"hello from three"))?;
    cluster.run_until(5_000, |c| !c.nodes[0].delivered.is_empty())?;

    let parcel = &cluster.nodes[0].delivered[0];
    assert_eq!(parcel.peer, addr(3));
    assert_eq!(parcel.payload, Bytes::from_static(b"hello from three"));
    assert!(!cluster.nodes[2].mac.outbox_full());
    assert!(cluster.nodes[2].mac.last_fault().is_none());
    assert!(cluster.nodes[1].delivered.is_empty(), "bystander got the parcel");
    Ok(())
}

/// Losing a frame mid-ring is repaired by retransmission or, at worst, a
/// warm boot. Either way the ring comes back with a single holder.
#[test]
fn test_ring_survives_lost_frame() -> Result<()> {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    cluster.converge()?;

    cluster.bus.drop_next(1);
    cluster.run_for(500)?;
    cluster.converge()?;

    cluster.nodes[0]
        .mac
        .submit_parcel(addr(2), Bytes::from_static(b"still here"))?;
    cluster.run_until(5_000, |c| !c.nodes[1].delivered.is_empty())?;
    assert_eq!(cluster.nodes[1].delivered[0].peer, addr(1));
    Ok(())
}

#[test]
fn test_speed_change_reaches_every_node() -> Result<()> {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    cluster.converge()?;

    cluster.nodes[1].mac.change_speed(57_600)?;
    cluster.run_until(5_000, |c| c.live().all(|n| n.mac.baud() == 57_600))?;
    for node in cluster.live() {
        assert_eq!(node.mac.port().speed(), 57_600);
    }

    cluster.converge()?;
    Ok(())
}

/// A bus reset throws every node back to silence; the ring then forms again.
#[test]
fn test_reset_bus_reforms_ring() -> Result<()> {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    cluster.converge()?;

    cluster.nodes[2].mac.reset_bus();
    assert!(!cluster.nodes[2].mac.token_held());
    assert!(cluster.nodes[2].mac.boot_state().is_silent());

    let reached = cluster.converge()?;
    println!("ring re-formed at {reached} ms");
    Ok(())
}
