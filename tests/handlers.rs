use anyhow::Result;
use pixelboard::canvas::Canvas;
use pixelboard::config::NodeConfig;
use pixelboard::raft::{LeaderVolatile, RaftNode, Role};
use pixelboard::{LogEntry, Pixel, RaftMessage};
use std::collections::HashMap;
use std::sync::Arc;

// Handler-level tests: no listeners, no timers, just a node and direct RPC
// handler calls.

fn make_node(peers: &str) -> Arc<RaftNode> {
    let config = NodeConfig {
        node_id: "n1".to_string(),
        host: "127.0.0.1".to_string(),
        http_port: 0,
        raft_port: 0,
        peers: NodeConfig::parse_peers(peers).unwrap(),
        election_timeout_min: 800,
        election_timeout_max: 1200,
        heartbeat_interval: 100,
        canvas_size: 64,
    };
    Arc::new(RaftNode::new(config, Canvas::new(64)))
}

fn entry(term: u64, index: u64, x: u32, y: u32, color: u32) -> LogEntry {
    LogEntry {
        term,
        index,
        pixel: Pixel { x, y, color },
    }
}

fn append_reply(message: RaftMessage) -> (u64, bool, u64) {
    match message {
        RaftMessage::AppendEntriesResponse {
            term,
            success,
            match_index,
            ..
        } => (term, success, match_index),
        other => panic!("not an AppendEntries reply: {:?}", other),
    }
}

fn vote_reply(message: RaftMessage) -> (u64, bool) {
    match message {
        RaftMessage::RequestVoteResponse {
            term, vote_granted, ..
        } => (term, vote_granted),
        other => panic!("not a RequestVote reply: {:?}", other),
    }
}

#[tokio::test]
async fn stale_leader_is_rejected_without_timer_reset() -> Result<()> {
    let node = make_node("n2:127.0.0.1:1:1");
    {
        let mut state = node.state.lock().await;
        state.current_term = 5;
    }
    let deadline_before = node.state.lock().await.last_heartbeat;

    let reply = node
        .on_append_entries(3, "old-leader".to_string(), 0, 0, vec![], 0)
        .await;
    let (term, success, _) = append_reply(reply);
    assert_eq!(term, 5);
    assert!(!success);

    let state = node.state.lock().await;
    assert_eq!(state.last_heartbeat, deadline_before);
    assert_eq!(state.leader_id, None);
    Ok(())
}

#[tokio::test]
async fn first_entry_lands_on_an_empty_log() -> Result<()> {
    let node = make_node("n2:127.0.0.1:1:1");

    let reply = node
        .on_append_entries(
            1,
            "n2".to_string(),
            0,
            0,
            vec![entry(1, 1, 2, 3, 0xAB)],
            1,
        )
        .await;
    let (term, success, match_index) = append_reply(reply);
    assert_eq!(term, 1);
    assert!(success);
    assert_eq!(match_index, 1);

    let state = node.state.lock().await;
    assert_eq!(state.commit_index, 1);
    assert_eq!(state.last_applied, 1);
    assert_eq!(state.canvas.get(2, 3), 0xAB);
    assert_eq!(state.leader_id.as_deref(), Some("n2"));
    Ok(())
}

#[tokio::test]
async fn heartbeats_never_mutate_the_log() -> Result<()> {
    let node = make_node("n2:127.0.0.1:1:1");
    node.on_append_entries(1, "n2".to_string(), 0, 0, vec![entry(1, 1, 0, 0, 1)], 0)
        .await;

    let reply = node
        .on_append_entries(1, "n2".to_string(), 1, 1, vec![], 0)
        .await;
    let (_, success, match_index) = append_reply(reply);
    assert!(success);
    assert_eq!(match_index, 1);
    assert_eq!(node.state.lock().await.log.last_index(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_prefix_is_rejected_with_a_rewind_hint() -> Result<()> {
    let node = make_node("n2:127.0.0.1:1:1");
    node.on_append_entries(1, "n2".to_string(), 0, 0, vec![entry(1, 1, 0, 0, 1)], 0)
        .await;

    // the leader is five entries ahead of us
    let reply = node
        .on_append_entries(1, "n2".to_string(), 5, 1, vec![entry(1, 6, 0, 0, 6)], 0)
        .await;
    let (_, success, match_index) = append_reply(reply);
    assert!(!success);
    assert_eq!(match_index, 1, "hint should point at our last index");
    Ok(())
}

#[tokio::test]
async fn conflicting_suffix_is_truncated_and_replaced() -> Result<()> {
    let node = make_node("n2:127.0.0.1:1:1");
    {
        let mut state = node.state.lock().await;
        state.current_term = 2;
        state.log.append(entry(1, 1, 1, 1, 0x01));
        state.log.append(entry(2, 2, 2, 2, 0x02));
    }

    let reply = node
        .on_append_entries(
            3,
            "n2".to_string(),
            1,
            1,
            vec![entry(3, 2, 5, 5, 0x55), entry(3, 3, 6, 6, 0x66)],
            0,
        )
        .await;
    let (term, success, match_index) = append_reply(reply);
    assert_eq!(term, 3);
    assert!(success);
    assert_eq!(match_index, 3);

    let state = node.state.lock().await;
    assert_eq!(state.log.term_at(2), 3);
    assert_eq!(state.log.get(2).unwrap().pixel.color, 0x55);
    assert_eq!(state.log.last_index(), 3);
    // nothing was committed, so nothing may have been applied
    assert_eq!(state.canvas.get(2, 2), 0);
    Ok(())
}

#[tokio::test]
async fn one_vote_per_term() -> Result<()> {
    let node = make_node("n2:127.0.0.1:1:1,n3:127.0.0.1:2:2");

    let (_, granted) = vote_reply(node.on_request_vote(1, "n2".to_string(), 0, 0).await);
    assert!(granted);

    let (_, granted) = vote_reply(node.on_request_vote(1, "n3".to_string(), 0, 0).await);
    assert!(!granted, "second candidate in the same term is refused");

    // re-asking from the same candidate is fine
    let (_, granted) = vote_reply(node.on_request_vote(1, "n2".to_string(), 0, 0).await);
    assert!(granted);
    Ok(())
}

#[tokio::test]
async fn stale_term_vote_is_refused() -> Result<()> {
    let node = make_node("n2:127.0.0.1:1:1");
    {
        node.state.lock().await.current_term = 5;
    }
    let (term, granted) = vote_reply(node.on_request_vote(3, "n2".to_string(), 9, 3).await);
    assert_eq!(term, 5);
    assert!(!granted);
    Ok(())
}

#[tokio::test]
async fn outdated_log_cannot_win_a_vote() -> Result<()> {
    let node = make_node("n2:127.0.0.1:1:1");
    {
        let mut state = node.state.lock().await;
        state.current_term = 2;
        state.log.append(entry(2, 1, 0, 0, 1));
    }

    // higher term but an older last log term: term bumps, vote refused
    let (term, granted) = vote_reply(node.on_request_vote(3, "n2".to_string(), 4, 1).await);
    assert_eq!(term, 3);
    assert!(!granted);
    assert_eq!(node.state.lock().await.voted_for, None);

    // equal last term and equal index is up-to-date enough
    let (_, granted) = vote_reply(node.on_request_vote(3, "n2".to_string(), 1, 2).await);
    assert!(granted);
    Ok(())
}

#[tokio::test]
async fn single_node_cluster_commits_alone() -> Result<()> {
    let node = make_node("");
    node.start_election().await;
    assert!(node.is_leader().await);

    assert!(
        node.submit_pixel(Pixel {
            x: 1,
            y: 1,
            color: 0x99
        })
        .await
    );
    let state = node.state.lock().await;
    assert_eq!(state.commit_index, 1);
    assert_eq!(state.canvas.get(1, 1), 0x99);
    Ok(())
}

#[tokio::test]
async fn out_of_bounds_pixels_are_refused() -> Result<()> {
    let node = make_node("");
    node.start_election().await;
    assert!(node.is_leader().await);

    assert!(
        !node
            .submit_pixel(Pixel {
                x: 64,
                y: 0,
                color: 1
            })
            .await
    );
    assert!(
        !node
            .submit_pixel(Pixel {
                x: 0,
                y: 200,
                color: 1
            })
            .await
    );
    assert_eq!(node.state.lock().await.log.last_index(), 0);
    Ok(())
}

#[tokio::test]
async fn submits_without_a_leader_fail_fast() -> Result<()> {
    let node = make_node("n2:127.0.0.1:1:1");
    assert!(
        !node
            .submit_pixel(Pixel {
                x: 0,
                y: 0,
                color: 1
            })
            .await
    );
    Ok(())
}

#[tokio::test]
async fn shutdown_fails_pending_submissions() -> Result<()> {
    // One unreachable peer, so the entry can never reach a majority and the
    // submission stays pending until shutdown drains it.
    let node = make_node("n2:127.0.0.1:1:19999");
    {
        let mut state = node.state.lock().await;
        state.current_term = 1;
        let mut next_index = HashMap::new();
        next_index.insert("n2".to_string(), 1);
        let mut match_index = HashMap::new();
        match_index.insert("n2".to_string(), 0);
        state.role = Role::Leader(LeaderVolatile {
            next_index,
            match_index,
            pending_commits: HashMap::new(),
        });
        state.leader_id = Some("n1".to_string());
    }

    let submitting = Arc::clone(&node);
    let pending = tokio::spawn(async move {
        submitting
            .submit_pixel(Pixel {
                x: 0,
                y: 0,
                color: 1,
            })
            .await
    });

    // let the submission register its completion first
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    node.shutdown().await;

    let accepted = tokio::time::timeout(std::time::Duration::from_secs(2), pending)
        .await
        .expect("submission must resolve promptly after shutdown")?;
    assert!(!accepted);
    Ok(())
}
