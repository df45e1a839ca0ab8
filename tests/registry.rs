//! Client registry tests over the in-memory transport.


use framecomm::prelude::*;
use mock_transport::{mock_peer, MockConnection};
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ============================================================================
// Membership
// ============================================================================

#[test]
fn add_is_idempotent() {
    let registry = ClientRegistry::new();
    let (peer, _conn) = mock_peer();

    assert!(registry.add(peer.clone()));
    assert!(!registry.add(peer.clone()));
    assert_eq!(registry.len(), 1);
    assert!(registry.contains(&peer));
    assert_eq!(registry.get(peer.id()), Some(peer));
}

#[test]
fn remove_shuts_connection_down() {
    let registry = ClientRegistry::new();
    let (peer, conn) = mock_peer();
    registry.add(peer.clone());

    registry.remove(&peer).expect("Failed to remove peer");
    assert!(conn.is_shut_down());
    assert!(!registry.contains(&peer));
    assert!(registry.is_empty());
}

#[test]
fn remove_unregistered_peer_fails_without_side_effects() {
    let registry = ClientRegistry::new();
    let (member, _member_conn) = mock_peer();
    let (stranger, stranger_conn) = mock_peer();
    registry.add(member.clone());

    let err = registry.remove(&stranger).expect_err("Removing a stranger must fail");
    assert!(matches!(err, Error::PeerNotFound { id } if id == stranger.id()));
    assert!(!stranger_conn.is_shut_down());
    assert_eq!(registry.peers(), vec![member]);
}

#[test]
fn removal_is_final() {
    let registry = ClientRegistry::new();
    let (peer, _conn) = mock_peer();
    registry.add(peer.clone());
    registry.remove(&peer).expect("Failed to remove peer");

    assert!(matches!(registry.remove(&peer), Err(Error::PeerNotFound { .. })));
    assert!(matches!(registry.send(&peer, b"x"), Err(Error::PeerNotFound { .. })));
}

#[test]
fn discard_reports_membership() {
    let registry = ClientRegistry::new();
    let (peer, conn) = mock_peer();
    assert!(!registry.discard(&peer));
    assert!(!conn.is_shut_down());

    registry.add(peer.clone());
    assert!(registry.discard(&peer));
    assert!(conn.is_shut_down());
    assert!(!registry.discard(&peer));
}

#[test]
fn peers_are_ordered_by_handle() {
    let registry = ClientRegistry::new();
    let peers: Vec<Peer> = (0..5).map(|_| mock_peer().0).collect();
    for peer in peers.iter().rev() {
        registry.add(peer.clone());
    }
    let mut expected = peers.clone();
    expected.sort();
    assert_eq!(registry.peers(), expected);
}

/// Concurrent adds followed by concurrent removes of a random subset leave
/// exactly the complement registered.
#[test]
fn concurrent_add_then_remove() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;

    let mut rng = rand::rng();
    for _ in 0..10 {
        let registry = Arc::new(ClientRegistry::new());
        let peers: Vec<(Peer, Arc<MockConnection>)> =
            (0..THREADS * PER_THREAD).map(|_| mock_peer()).collect();

        let adders: Vec<_> = peers
            .chunks(PER_THREAD)
            .map(|chunk| {
                let registry = Arc::clone(&registry);
                let chunk: Vec<Peer> = chunk.iter().map(|(p, _)| p.clone()).collect();
                thread::spawn(move || {
                    for peer in chunk {
                        assert!(registry.add(peer));
                    }
                })
            })
            .collect();
        for adder in adders {
            adder.join().expect("Adder panicked");
        }
        assert_eq!(registry.len(), THREADS * PER_THREAD);

        let mut to_remove: Vec<Peer> = peers.iter().map(|(p, _)| p.clone()).collect();
        to_remove.shuffle(&mut rng);
        let keep = to_remove.split_off(to_remove.len() / 3 * 2);

        let removers: Vec<_> = to_remove
            .chunks(to_remove.len().div_ceil(THREADS / 2))
            .map(|chunk| {
                let registry = Arc::clone(&registry);
                let chunk = chunk.to_vec();
                thread::spawn(move || {
                    for peer in chunk {
                        registry.remove(&peer).expect("Failed to remove peer");
                    }
                })
            })
            .collect();
        for remover in removers {
            remover.join().expect("Remover panicked");
        }

        let remaining: BTreeSet<usize> = registry.peers().iter().map(Peer::id).collect();
        let expected: BTreeSet<usize> = keep.iter().map(Peer::id).collect();
        assert_eq!(remaining, expected);

        for (peer, conn) in &peers {
            assert_eq!(conn.is_shut_down(), !expected.contains(&peer.id()));
        }
    }
}

// ============================================================================
// Data Operations
// ============================================================================

#[test]
fn send_writes_to_registered_peer() {
    let registry = ClientRegistry::new();
    let (peer, conn) = mock_peer();
    registry.add(peer.clone());

    registry.send(&peer, b"payload").expect("Failed to send");
    assert_eq!(conn.sent(), vec![b"payload".to_vec()]);
}

#[test]
fn send_to_unregistered_peer_writes_nothing() {
    let registry = ClientRegistry::new();
    let (peer, conn) = mock_peer();

    let err = registry.send(&peer, b"payload").expect_err("Send must fail");
    assert!(matches!(err, Error::PeerNotFound { .. }));
    assert!(conn.sent().is_empty());
}

#[test]
fn send_surfaces_transport_error() {
    let registry = ClientRegistry::new();
    let (peer, conn) = mock_peer();
    registry.add(peer.clone());
    conn.fail_sends();

    assert!(matches!(registry.send(&peer, b"x"), Err(Error::Io(_))));
    assert!(registry.contains(&peer), "A failed send does not unregister");
}

#[test]
fn broadcast_reaches_everyone_despite_one_failure() {
    let registry = ClientRegistry::new();
    let peers: Vec<(Peer, Arc<MockConnection>)> = (0..3).map(|_| mock_peer()).collect();
    for (peer, _) in &peers {
        registry.add(peer.clone());
    }
    peers[1].1.fail_sends();

    let failures = registry.broadcast(b"news");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].peer, peers[1].0);
    assert!(matches!(failures[0].error, Error::Io(_)));

    assert_eq!(peers[0].1.sent(), vec![b"news".to_vec()]);
    assert!(peers[1].1.sent().is_empty());
    assert_eq!(peers[2].1.sent(), vec![b"news".to_vec()]);
}

#[test]
fn broadcast_to_empty_registry() {
    let registry = ClientRegistry::new();
    assert!(registry.broadcast(b"anyone?").is_empty());
}

#[test]
fn send_many_is_best_effort() {
    let registry = ClientRegistry::new();
    let (ok_peer, ok_conn) = mock_peer();
    let (broken_peer, broken_conn) = mock_peer();
    let (stranger, stranger_conn) = mock_peer();
    let (last_peer, last_conn) = mock_peer();
    registry.add(ok_peer.clone());
    registry.add(broken_peer.clone());
    registry.add(last_peer.clone());
    broken_conn.fail_sends();

    let targets = [ok_peer, broken_peer.clone(), stranger.clone(), last_peer];
    let failures = registry.send_many(&targets, b"hi");

    let failed: Vec<Peer> = failures.iter().map(|f| f.peer.clone()).collect();
    assert_eq!(failed, vec![broken_peer, stranger]);
    assert!(matches!(failures[1].error, Error::PeerNotFound { .. }));
    assert_eq!(ok_conn.sent(), vec![b"hi".to_vec()]);
    assert_eq!(last_conn.sent(), vec![b"hi".to_vec()]);
    assert!(stranger_conn.sent().is_empty());
}

#[test]
fn shutdown_all_keeps_peers_registered() {
    let registry = ClientRegistry::new();
    let peers: Vec<(Peer, Arc<MockConnection>)> = (0..4).map(|_| mock_peer()).collect();
    for (peer, _) in &peers {
        registry.add(peer.clone());
    }

    registry.shutdown_all();
    assert_eq!(registry.len(), 4);
    assert!(peers.iter().all(|(_, conn)| conn.shutdown_calls() == 1));
}

#[test]
fn shutdown_all_then_runs_under_the_lock() {
    let registry = Arc::new(ClientRegistry::new());
    let (member, member_conn) = mock_peer();
    let (late, late_conn) = mock_peer();
    registry.add(member);

    let (tx, rx) = std::sync::mpsc::channel();
    let result = registry.shutdown_all_then(|| {
        assert!(member_conn.is_shut_down(), "Members go down first");

        // A concurrent add has to wait until the closure is done
        let registry = Arc::clone(&registry);
        let adder = thread::spawn(move || {
            registry.add(late);
            tx.send(()).expect("Failed to report add");
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        (adder, "closed")
    });

    let (adder, outcome) = result;
    assert_eq!(outcome, "closed");
    adder.join().expect("Adder panicked");
    assert_eq!(registry.len(), 2);
    assert!(!late_conn.is_shut_down(), "Peers added afterwards are left alone");
}
