//! Request/response surface tests against real sessions: the same path a
//! host transport would exercise, from tagged request to pushed events.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use canopy_shell::commands::{
    dispatch, forward_registry_events, subscribe_events, ShellEvent, ShellRequest, ShellResponse,
};
use canopy_shell::core::{ShellSupervisor, SupervisorConfig};

fn supervisor() -> ShellSupervisor {
    ShellSupervisor::new(SupervisorConfig {
        worker_exe: Some(PathBuf::from(env!("CARGO_BIN_EXE_canopy-worker"))),
        ..SupervisorConfig::default()
    })
}

async fn start(supervisor: &ShellSupervisor, worktree: &str) -> String {
    let response = dispatch(
        supervisor,
        ShellRequest::Start {
            worktree_path: worktree.to_string(),
            cols: Some(100),
            rows: Some(30),
            force_new: None,
            terminal_id: None,
            set_locale: None,
        },
    )
    .await;
    match response {
        ShellResponse::Start(start) => {
            assert!(start.success, "start failed: {:?}", start.error);
            assert_eq!(start.is_new, Some(true));
            start.process_id.unwrap()
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn full_round_trip_over_the_command_surface() {
    let sup = supervisor();
    let dir = tempfile::tempdir().unwrap();
    let worktree = dir.path().to_string_lossy().into_owned();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ShellEvent>();
    forward_registry_events(&sup, tx.clone());

    let process_id = start(&sup, &worktree).await;

    let _guard = subscribe_events(&sup, &process_id, "ui", tx, false).unwrap();

    let response = dispatch(
        &sup,
        ShellRequest::Write {
            process_id: process_id.clone(),
            data: "echo wire_$((40+2))\r".to_string(),
        },
    )
    .await;
    assert!(matches!(response, ShellResponse::Ack(a) if a.success));

    let response = dispatch(
        &sup,
        ShellRequest::Resize {
            process_id: process_id.clone(),
            cols: 120,
            rows: 40,
        },
    )
    .await;
    assert!(matches!(response, ShellResponse::Ack(a) if a.success));

    // Collect pushed output until the expansion shows up, remembering any
    // sessions-changed totals seen along the way.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut seen = String::new();
    let mut totals: Vec<usize> = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline.into(), rx.recv()).await {
            Ok(Some(ShellEvent::Output { data, .. })) => {
                seen.push_str(&data);
                if seen.contains("wire_42") {
                    break;
                }
            }
            Ok(Some(ShellEvent::SessionsChanged { counts })) => {
                totals.push(counts.values().sum::<usize>());
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => panic!("no arithmetic output observed: {seen}"),
        }
    }

    // The stats and buffer views agree with what the subscriber saw.
    let response = dispatch(&sup, ShellRequest::GetStats).await;
    match response {
        ShellResponse::Stats(stats) => {
            assert_eq!(stats.active_process_count, 1);
            assert_eq!(stats.sessions[0].id, process_id);
            assert_eq!(stats.sessions[0].worktree_path, worktree);
            assert_eq!(stats.sessions[0].cols, 120);
            assert_eq!(stats.sessions[0].rows, 40);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    let response = dispatch(
        &sup,
        ShellRequest::GetBuffer {
            process_id: process_id.clone(),
        },
    )
    .await;
    match response {
        ShellResponse::Buffer(buffer) => {
            assert!(buffer.success);
            assert!(buffer.buffer.unwrap().contains("wire_42"));
        }
        other => panic!("unexpected response: {other:?}"),
    }

    // Terminate over the wire and observe the pushed exit event.
    let response = dispatch(
        &sup,
        ShellRequest::Terminate {
            process_id: process_id.clone(),
        },
    )
    .await;
    assert!(matches!(response, ShellResponse::Ack(a) if a.success));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline.into(), rx.recv()).await {
            Ok(Some(ShellEvent::Exit { process_id: id, .. })) => {
                assert_eq!(id, process_id);
                break;
            }
            Ok(Some(ShellEvent::SessionsChanged { counts })) => {
                totals.push(counts.values().sum::<usize>());
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => panic!("no exit event observed"),
        }
    }

    let response = dispatch(&sup, ShellRequest::GetStats).await;
    assert!(matches!(
        response,
        ShellResponse::Stats(stats) if stats.active_process_count == 0
    ));

    // Registry mutations were pushed as sessions-changed events: one for
    // the start (count 1), one for the termination (count 0).
    while let Ok(event) = rx.try_recv() {
        if let ShellEvent::SessionsChanged { counts } = event {
            totals.push(counts.values().sum::<usize>());
        }
    }
    assert_eq!(totals, vec![1, 0]);
}

#[tokio::test]
async fn spawn_errors_surface_over_the_wire() {
    let sup = ShellSupervisor::new(SupervisorConfig {
        worker_exe: Some(PathBuf::from("/nonexistent/canopy-worker")),
        ..SupervisorConfig::default()
    });
    let dir = tempfile::tempdir().unwrap();

    let response = dispatch(
        &sup,
        ShellRequest::Start {
            worktree_path: dir.path().to_string_lossy().into_owned(),
            cols: None,
            rows: None,
            force_new: None,
            terminal_id: None,
            set_locale: None,
        },
    )
    .await;
    match response {
        ShellResponse::Start(start) => {
            assert!(!start.success);
            // The OS error string comes through verbatim for the client to
            // pattern-match against.
            assert!(start.error.unwrap().contains("No such file"));
        }
        other => panic!("unexpected response: {other:?}"),
    }

    let response = dispatch(&sup, ShellRequest::GetSpawnErrors).await;
    match response {
        ShellResponse::SpawnErrors(errors) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].os_code.as_deref(), Some("ENOENT"));
        }
        other => panic!("unexpected response: {other:?}"),
    }
}
