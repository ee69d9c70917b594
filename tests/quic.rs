#![cfg(feature = "quic")]

use std::{net::SocketAddr, sync::Arc};

use bulletin::{
    net::quic::QuicTransport, Arg, BoardConfig, Buffer, Call, Client, FunctionTable,
    NetConfig, TaskValue, Working,
};

fn table() -> Arc<FunctionTable> {
    Arc::new(FunctionTable::new().register("square", |args| {
        let x = args.first().and_then(Arg::as_scalar).unwrap_or(0.0);
        Ok(TaskValue::Scalar(x * x))
    }))
}

#[tokio::test]
async fn loopback_master_and_worker() {
    let listen = NetConfig::builder()
        .addr(SocketAddr::from(([127, 0, 0, 1], 0)))
        .build();
    let transport = QuicTransport::listen(&listen).await.unwrap();
    let addr = transport.local_addr().unwrap();

    let worker = tokio::spawn(async move {
        let config = NetConfig::builder().addr(addr).build();
        let transport = QuicTransport::connect(&config).await?;
        let mut client = Client::join(transport, table(), BoardConfig::default()).await?;
        assert_eq!(client.id(), 1);
        client.post("ready", Buffer::empty()).await?;
        client.worker().await?;
        Ok::<_, bulletin::Error>(client.stats().executed)
    });

    let mut master = Client::master(transport, table(), BoardConfig::default()).unwrap();
    master.take("ready").await.unwrap();
    assert_eq!(master.server().unwrap().workers().count(), 1);
    master.master_works(false);

    for i in 0..8 {
        master
            .submit(i, Call::function("square", vec![Arg::Scalar(f64::from(i))]))
            .await
            .unwrap();
    }
    let mut total = 0.0;
    while let Working::Completed(done) = master.working().await.unwrap() {
        total += done.scalar().unwrap();
    }
    assert_eq!(total, 140.0);

    master.done().await.unwrap();
    assert_eq!(worker.await.unwrap().unwrap(), 8);
}

#[tokio::test]
async fn quit_reaches_the_worker_when_the_master_exits_right_after_done() {
    let listen = NetConfig::builder()
        .addr(SocketAddr::from(([127, 0, 0, 1], 0)))
        .build();
    let transport = QuicTransport::listen(&listen).await.unwrap();
    let addr = transport.local_addr().unwrap();

    let worker = tokio::spawn(async move {
        let config = NetConfig::builder().addr(addr).build();
        let transport = QuicTransport::connect(&config).await?;
        let mut client = Client::join(transport, table(), BoardConfig::default()).await?;
        client.post("ready", Buffer::empty()).await?;
        client.worker().await
    });

    let mut master = Client::master(transport, table(), BoardConfig::default()).unwrap();
    master.take("ready").await.unwrap();
    master.done().await.unwrap();
    drop(master);

    worker.await.unwrap().unwrap();
}
