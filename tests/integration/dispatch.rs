use std::time::Duration;

use scatter_core::{ObjectId, WorkOutcome};
use scatter_services::{DispatchError, OrderedDistributor, WorkItem};

use crate::*;

/// Stable, readable resource ids for the scenario: "r1" → hex of its bytes, padded.
fn named_id(name: &str) -> ObjectId {
    let mut hex: String = name.bytes().map(|b| format!("{b:02x}")).collect();
    while hex.len() < 64 {
        hex.push('0');
    }
    hex.parse().expect("valid id")
}

/// Three inputs, two workers, ordered results.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_requests_two_workers_in_order() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    let mut client = node(&server, fast_messenger())?;
    let mut w1 = node(&server, fast_messenger())?;
    let mut w2 = node(&server, fast_messenger())?;
    form_fleet(&server, &mut [&mut client], &mut [&mut w1, &mut w2]).await?;

    let workers = [spawn_append_worker(w1), spawn_append_worker(w2)];

    let inputs = [("r1", "1"), ("r2", "2"), ("r3", "3")];
    for (name, payload) in inputs {
        client.store().put(&named_id(name), payload.as_bytes()).await?;
    }

    let mut ordered = OrderedDistributor::new(client, Duration::from_secs(20));
    for (name, _) in inputs {
        ordered.send_request(named_id(name), &b"-done"[..]).await?;
    }

    let mut results = Vec::new();
    while let Some(output) = ordered.receive_response().await? {
        let data = ordered.inner().store().load(&output, Duration::from_secs(5)).await?;
        results.push(String::from_utf8(data.to_vec())?);
    }
    assert_eq!(results, ["1-done", "2-done", "3-done"]);

    for w in workers {
        w.abort();
    }
    Ok(())
}

/// Slow early requests must not let later answers jump the queue.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_order_survives_out_of_order_completion() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    let mut client = node(&server, fast_messenger())?;
    let mut w1 = node(&server, fast_messenger())?;
    let mut w2 = node(&server, fast_messenger())?;
    form_fleet(&server, &mut [&mut client], &mut [&mut w1, &mut w2]).await?;

    // Earlier inputs take longer to process.
    let spawn_slow = |mut node: WorkDistributor| {
        let store = node.store().clone();
        tokio::spawn(async move {
            node.process_requests(move |item: WorkItem| {
                let store = store.clone();
                async move {
                    let n: u64 = std::str::from_utf8(&item.command)?.trim_start_matches("sleep ").parse()?;
                    tokio::time::sleep(Duration::from_millis(n)).await;
                    let id = item.output_id();
                    store.put(&id, &item.command).await?;
                    Ok::<_, anyhow::Error>(id)
                }
            })
            .await
        })
    };
    let workers = [spawn_slow(w1), spawn_slow(w2)];

    let mut ordered = OrderedDistributor::new(client, Duration::from_secs(20));
    let mut expected = Vec::new();
    for delay in [400u64, 300, 200, 100, 0] {
        let input = ObjectId::random();
        let command = format!("sleep {delay}");
        expected.push(ObjectId::derive(&input, command.as_bytes()));
        ordered.send_request(input, command.into_bytes()).await?;
    }

    let mut got = Vec::new();
    while let Some(output) = ordered.receive_response().await? {
        got.push(output);
    }
    assert_eq!(got, expected);

    for w in workers {
        w.abort();
    }
    Ok(())
}

/// A failing or panicking handler answers with an error instead of going silent.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crashing_handler_reports_error() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    let mut client = node(&server, fast_messenger())?;
    let mut worker = node(&server, fast_messenger())?;
    form_fleet(&server, &mut [&mut client], &mut [&mut worker]).await?;
    let worker_ep = worker.local_endpoint();

    let handle = tokio::spawn(async move {
        worker
            .process_requests(|item: WorkItem| async move {
                match &item.command[..] {
                    b"panic" => panic!("worker blew up"),
                    b"fail" => anyhow::bail!("input rejected"),
                    _ => Ok(item.output_id()),
                }
            })
            .await
    });

    let mut outcomes = Vec::new();
    for command in ["panic", "fail", "ok"] {
        client.send_request(ObjectId::random(), command.as_bytes().to_vec()).await?;
        let response = client
            .receive_response(Duration::from_secs(10))
            .await?
            .context("no response")?;
        outcomes.push(response.outcome);
    }

    assert_eq!(
        outcomes[0],
        WorkOutcome::Failed(format!("panic at {worker_ep}: panicked: worker blew up"))
    );
    assert_eq!(
        outcomes[1],
        WorkOutcome::Failed(format!("fail at {worker_ep}: input rejected"))
    );
    assert!(matches!(outcomes[2], WorkOutcome::Done(_)));
    assert!(!handle.is_finished(), "the worker loop survives its handler");

    handle.abort();
    Ok(())
}

/// Error responses surface through the ordered distributor as errors.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ordered_error_then_success() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    let mut client = node(&server, fast_messenger())?;
    let mut worker = node(&server, fast_messenger())?;
    form_fleet(&server, &mut [&mut client], &mut [&mut worker]).await?;

    // No input object exists for "missing": the handler's load times out quickly.
    let store = worker.store().clone();
    let handle = tokio::spawn(async move {
        worker
            .process_requests(move |item: WorkItem| {
                let store = store.clone();
                async move {
                    if &item.command[..] == b"missing" {
                        store.load(&item.resource_id, Duration::from_millis(100)).await?;
                    }
                    Ok::<_, anyhow::Error>(item.output_id())
                }
            })
            .await
    });

    let mut ordered = OrderedDistributor::new(client, Duration::from_secs(20));
    ordered.send_request(ObjectId::random(), &b"missing"[..]).await?;
    let good = ObjectId::random();
    ordered.send_request(good, &b"fine"[..]).await?;

    let err = ordered.receive_response().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DispatchError>(),
        Some(DispatchError::Remote { .. })
    ));
    assert_eq!(
        ordered.receive_response().await?,
        Some(ObjectId::derive(&good, b"fine"))
    );
    assert_eq!(ordered.receive_response().await?, None);

    handle.abort();
    Ok(())
}

/// Running the same request twice lands on the same output object.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_request_is_idempotent() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    let mut client = node(&server, fast_messenger())?;
    let mut w1 = node(&server, fast_messenger())?;
    let mut w2 = node(&server, fast_messenger())?;
    form_fleet(&server, &mut [&mut client], &mut [&mut w1, &mut w2]).await?;
    let workers = [spawn_append_worker(w1), spawn_append_worker(w2)];

    let input = named_id("dup");
    client.store().put(&input, b"base").await?;

    let mut outputs = Vec::new();
    for _ in 0..2 {
        client.send_request(input, &b"+x"[..]).await?;
        let response = client
            .receive_response(Duration::from_secs(10))
            .await?
            .context("no response")?;
        outputs.push(response.into_result()?);
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], ObjectId::derive(&input, b"+x"));

    client.store().clear_local();
    let data = client.store().load(&outputs[0], Duration::from_secs(5)).await?;
    assert_eq!(&data[..], b"base+x");

    for w in workers {
        w.abort();
    }
    Ok(())
}

/// A worker that never answers is sinbinned; fresh work routes around it,
/// but a request already bound to it stays bound.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dead_worker_is_routed_around() -> Result<()> {
    init_tracing();
    let server = start_dav_server().await?;
    let config = MessengerConfig {
        ack_timeout_ms: 30,
        max_retries: 2,
        sinbin_factor: 1_000,
        ..MessengerConfig::default()
    };
    let mut client = node(&server, config)?;
    let mut live = node(&server, fast_messenger())?;
    let mut dead = node(&server, fast_messenger())?;
    form_fleet(&server, &mut [&mut client], &mut [&mut live, &mut dead]).await?;
    let dead_ep = dead.local_endpoint();
    let live_ep = live.local_endpoint();
    let handle = spawn_append_worker(live);
    // `dead` keeps its socket open but never reads it.

    let stuck = loop {
        let id = ObjectId::random();
        if client.messenger().route(&id) == Some(dead_ep) {
            break id;
        }
    };
    let stuck_request = client.send_request(stuck, &b"never"[..]).await?;

    // Keep receiving until the retries push the dead worker into the sinbin.
    let mut waited = Duration::ZERO;
    while !client
        .messenger()
        .peer(&dead_ep)
        .is_some_and(|p| p.sinbin_until.is_some())
    {
        assert!(waited < Duration::from_secs(5), "dead worker never sinbinned");
        client.receive_response(Duration::from_millis(50)).await?;
        waited += Duration::from_millis(50);
    }
    assert_eq!(client.messenger().route(&stuck), Some(live_ep));

    // Fresh work for the same key completes on the live worker.
    client.store().put(&stuck, b"in").await?;
    let fresh = client.send_request(stuck, &b"-again"[..]).await?;
    let response = loop {
        let r = client
            .receive_response(Duration::from_secs(5))
            .await?
            .context("no response from live worker")?;
        if r.request_id == fresh {
            break r;
        }
    };
    assert_eq!(response.from, live_ep);
    assert_ne!(response.request_id, stuck_request);

    // The original request never re-routes.
    assert_eq!(client.messenger().awaiting_ack(), 1);

    handle.abort();
    drop(dead);
    Ok(())
}
