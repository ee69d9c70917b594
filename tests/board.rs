use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use bulletin::{
    net::mesh::{mesh, MeshTransport},
    Arg, BoardConfig, Buffer, Call, Client, Error, Executor, FunctionTable, Phase,
    TaskFailure, TaskValue, Working,
};
use tokio::task::JoinHandle;

fn arithmetic() -> FunctionTable {
    FunctionTable::new()
        .register("add", |args| {
            let sum = args.iter().filter_map(Arg::as_scalar).sum();
            Ok(TaskValue::Scalar(sum))
        })
        .register("boom", |_| Err(TaskFailure("boom".into())))
}

fn add(a: f64, b: f64) -> Call {
    Call::function("add", vec![Arg::Scalar(a), Arg::Scalar(b)])
}

/// `fib(n)` by submitting `fib(n - 1)` and `fib(n - 2)` and summing them.
/// `whoami` answers with the id of the executing participant, and `announce`
/// posts it under `seen`.
struct Demo;

#[async_trait]
impl Executor for Demo {
    async fn execute(
        &self,
        client: &mut Client,
        call: Call,
    ) -> Result<TaskValue, TaskFailure> {
        let Call::Function { name, args } = call else {
            return Err(TaskFailure("unsupported call".into()));
        };
        match name.as_str() {
            "whoami" => Ok(TaskValue::Scalar(f64::from(client.id()))),
            "announce" => {
                let mut p = bulletin::Packer::begin();
                p.int(i64::from(client.id()));
                client.post("seen", p.finish()).await?;
                Ok(TaskValue::Scalar(0.0))
            }
            "panic" => panic!("executor blew up"),
            "fib" => {
                let n = args.first().and_then(Arg::as_scalar).unwrap_or(0.0);
                if n < 2.0 {
                    return Ok(TaskValue::Scalar(n));
                }
                client.submit(1, fib(n - 1.0)).await?;
                client.submit(2, fib(n - 2.0)).await?;
                let mut sum = 0.0;
                while let Working::Completed(done) = client.working().await? {
                    sum += done
                        .scalar()
                        .ok_or_else(|| TaskFailure("subtask failed".into()))?;
                }
                Ok(TaskValue::Scalar(sum))
            }
            other => Err(TaskFailure(format!("no function named `{other}`"))),
        }
    }
}

fn fib(n: f64) -> Call {
    Call::function("fib", vec![Arg::Scalar(n)])
}

fn whoami() -> Call {
    Call::function("whoami", vec![])
}

async fn drain(client: &mut Client) -> BTreeMap<i32, f64> {
    let mut results = BTreeMap::new();
    while let Working::Completed(done) = client.working().await.unwrap() {
        results.insert(done.requester, done.scalar().unwrap());
    }
    results
}

/// Spawns a worker on every transport. Each one posts `ready` once the master
/// knows about it.
fn spawn_workers(
    transports: Vec<MeshTransport>,
    executor: Arc<dyn Executor>,
) -> Vec<JoinHandle<bulletin::Result<()>>> {
    transports
        .into_iter()
        .map(|transport| {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                let mut client =
                    Client::join(transport, executor, BoardConfig::default()).await?;
                client.post("ready", Buffer::empty()).await?;
                client.worker().await
            })
        })
        .collect()
}

async fn master_with_workers(
    n: usize,
    executor: Arc<dyn Executor>,
) -> (Client, Vec<JoinHandle<bulletin::Result<()>>>) {
    let mut transports = mesh(n + 1);
    let workers = transports.split_off(1);
    let master_transport = transports.pop().unwrap();
    let handles = spawn_workers(workers, Arc::clone(&executor));
    let mut master =
        Client::master(master_transport, executor, BoardConfig::default()).unwrap();
    for _ in 0..n {
        master.take("ready").await.unwrap();
    }
    (master, handles)
}

async fn finish(mut master: Client, handles: Vec<JoinHandle<bulletin::Result<()>>>) {
    master.done().await.unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn solo_results_come_back_to_their_requester() {
    let mut client = Client::solo(Arc::new(arithmetic()));
    client.submit(7, add(2.0, 3.0)).await.unwrap();
    client.submit(8, add(10.0, 20.0)).await.unwrap();

    let results = drain(&mut client).await;
    assert_eq!(results, BTreeMap::from([(7, 5.0), (8, 30.0)]));
    assert_eq!(client.working().await.unwrap(), Working::Idle);
    assert_eq!(client.stats().executed, 2);
    assert_eq!(client.stats().claimed, 2);
}

#[tokio::test]
async fn working_with_nothing_submitted_is_idle() {
    let mut client = Client::solo(Arc::new(arithmetic()));
    assert!(!client.working().await.unwrap().found());
    assert_eq!(client.phase(), Phase::AwaitingOwnResult);
}

#[tokio::test]
async fn solo_recursion() {
    let mut client = Client::solo(Arc::new(Demo));
    client.submit(0, fib(10.0)).await.unwrap();
    let done = client.working().await.unwrap().completion().unwrap();
    assert_eq!(done.scalar(), Some(55.0));
    assert_eq!(client.working_id(), 0);
    assert!(client.server().unwrap().work_len() == 0);
}

#[tokio::test]
async fn failures_are_results() {
    let mut client = Client::solo(Arc::new(arithmetic()));
    client
        .submit(1, Call::function("boom", vec![]))
        .await
        .unwrap();
    client
        .submit(2, Call::function("missing", vec![]))
        .await
        .unwrap();
    client.submit(3, Call::statement("x <- 1")).await.unwrap();

    for _ in 0..3 {
        let done = client.working().await.unwrap().completion().unwrap();
        assert!(done.outcome.is_err(), "{done:?}");
    }
    let done = client.working().await.unwrap();
    assert_eq!(done, Working::Idle);
}

#[tokio::test]
async fn panics_become_failures() {
    let mut client = Client::solo(Arc::new(Demo));
    client
        .submit(1, Call::function("panic", vec![]))
        .await
        .unwrap();
    let done = client.working().await.unwrap().completion().unwrap();
    assert_eq!(
        done.outcome,
        Err(TaskFailure("executor blew up".into()))
    );
}

#[tokio::test]
async fn negative_requesters_get_their_args_back() {
    let mut client = Client::solo(Arc::new(arithmetic()));
    let (first, _) = client.submit_auto(add(1.0, 1.0)).await.unwrap();
    let (second, _) = client.submit_auto(add(2.0, 2.0)).await.unwrap();
    client.submit(5, add(3.0, 3.0)).await.unwrap();
    assert_eq!((first, second), (-1, -2));

    let mut seen = BTreeMap::new();
    while let Working::Completed(done) = client.working().await.unwrap() {
        seen.insert(done.requester, done.args);
    }
    assert_eq!(seen[&-1], Some(add(1.0, 1.0)));
    assert_eq!(seen[&-2], Some(add(2.0, 2.0)));
    assert_eq!(seen[&5], None);
}

#[tokio::test]
async fn solo_mailbox() {
    let mut client = Client::solo(Arc::new(arithmetic()));
    assert_eq!(client.look_take("k").await.unwrap(), None);
    client.post("k", Buffer::from(&b"one"[..])).await.unwrap();
    client.post("k", Buffer::from(&b"two"[..])).await.unwrap();
    assert_eq!(client.look("k").await.unwrap().unwrap().as_bytes(), b"one");
    assert_eq!(client.take("k").await.unwrap().as_bytes(), b"one");
    assert_eq!(client.look_take("k").await.unwrap().unwrap().as_bytes(), b"two");
}

#[tokio::test]
async fn solo_take_with_nobody_to_post_stalls() {
    let mut client = Client::solo(Arc::new(arithmetic()));
    assert!(matches!(
        client.take("never").await,
        Err(Error::Stalled(_))
    ));
}

#[tokio::test]
async fn abandoned_take_keeps_later_posts_under_their_key() {
    let mut client = Client::solo(Arc::new(arithmetic()));
    assert!(matches!(client.take("a").await, Err(Error::Stalled(_))));
    assert_eq!(client.server().unwrap().waiters("a"), 0);

    client.post("a", Buffer::from(&b"for-a"[..])).await.unwrap();
    assert_eq!(client.look("a").await.unwrap().unwrap().as_bytes(), b"for-a");
    assert!(matches!(client.take("b").await, Err(Error::Stalled(_))));
    assert_eq!(client.take("a").await.unwrap().as_bytes(), b"for-a");
    assert_eq!(client.server().unwrap().mailbox_len("a"), 0);
}

#[tokio::test]
async fn done_is_idempotent() {
    let mut client = Client::solo(Arc::new(arithmetic()));
    client.submit(1, add(1.0, 2.0)).await.unwrap();
    client.done().await.unwrap();
    client.done().await.unwrap();
    assert_eq!(client.server().unwrap().ready_len(), 0);
}

#[tokio::test]
async fn master_needs_the_master_transport() {
    let mut transports = mesh(2);
    let worker = transports.pop().unwrap();
    let result = Client::master(worker, Arc::new(arithmetic()), BoardConfig::default());
    assert!(matches!(result, Err(Error::NotMaster(_))));
}

#[tokio::test]
async fn mesh_results_come_back_to_their_requester() {
    let (mut master, handles) = master_with_workers(2, Arc::new(arithmetic())).await;
    for i in 0..20 {
        master.submit(i, add(f64::from(i), 1.0)).await.unwrap();
    }
    let results = drain(&mut master).await;
    let expected: BTreeMap<_, _> = (0..20).map(|i| (i, f64::from(i) + 1.0)).collect();
    assert_eq!(results, expected);
    finish(master, handles).await;
}

#[tokio::test]
async fn mesh_recursion() {
    let (mut master, handles) = master_with_workers(3, Arc::new(Demo)).await;
    master.submit(0, fib(12.0)).await.unwrap();
    master.submit(1, fib(5.0)).await.unwrap();
    let results = drain(&mut master).await;
    assert_eq!(results, BTreeMap::from([(0, 144.0), (1, 5.0)]));
    finish(master, handles).await;
}

#[tokio::test]
async fn idle_master_leaves_the_work_to_workers() {
    let (mut master, handles) = master_with_workers(2, Arc::new(Demo)).await;
    master.master_works(false);
    for i in 0..10 {
        master.submit(i, whoami()).await.unwrap();
    }
    let results = drain(&mut master).await;
    assert_eq!(results.len(), 10);
    assert!(results.values().all(|&id| id != 0.0), "{results:?}");
    assert_eq!(master.stats().executed, 0);
    finish(master, handles).await;
}

#[tokio::test]
async fn master_works_alone_regardless() {
    let mut client = Client::solo(Arc::new(Demo));
    client.master_works(false);
    client.submit(1, whoami()).await.unwrap();
    let results = drain(&mut client).await;
    assert_eq!(results, BTreeMap::from([(1, 0.0)]));
}

#[tokio::test]
async fn context_reaches_every_worker() {
    let (mut master, handles) = master_with_workers(2, Arc::new(Demo)).await;
    master
        .context(Call::function("announce", vec![]))
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let buf = master.take("seen").await.unwrap();
        seen.push(bulletin::Unpacker::begin(&buf).int().unwrap());
    }
    seen.sort();
    assert_eq!(seen, vec![1, 2]);
    finish(master, handles).await;
}

#[tokio::test]
async fn workers_cannot_run_the_board() {
    let mut transports = mesh(2);
    let worker_transport = transports.pop().unwrap();
    let master_transport = transports.pop().unwrap();

    let worker = tokio::spawn(async move {
        let mut client =
            Client::join(worker_transport, Arc::new(Demo), BoardConfig::default()).await?;
        let refused = client.context(whoami()).await;
        assert!(matches!(refused, Err(Error::NotMaster(_))));
        client.done().await?;
        assert!(!client.is_master());
        client.post("ready", Buffer::empty()).await?;
        client.worker().await
    });

    let mut master =
        Client::master(master_transport, Arc::new(Demo), BoardConfig::default()).unwrap();
    assert!(master.is_master());
    master.take("ready").await.unwrap();
    finish(master, vec![worker]).await;
}

#[tokio::test]
async fn take_waits_for_a_post_from_another_participant() {
    let mut transports = mesh(2);
    let worker_transport = transports.pop().unwrap();
    let master_transport = transports.pop().unwrap();

    let worker = tokio::spawn(async move {
        let mut client =
            Client::join(worker_transport, Arc::new(Demo), BoardConfig::default()).await?;
        let question = client.take("question").await?;
        let mut answer = question.to_vec();
        answer.reverse();
        client.post("answer", Buffer::from(answer)).await?;
        client.worker().await
    });

    let mut master =
        Client::master(master_transport, Arc::new(Demo), BoardConfig::default()).unwrap();
    master
        .post("question", Buffer::from(&b"abc"[..]))
        .await
        .unwrap();
    let answer = master.take("answer").await.unwrap();
    assert_eq!(answer.as_bytes(), b"cba");
    finish(master, vec![worker]).await;
}

#[tokio::test]
async fn done_with_work_outstanding_releases_every_worker() {
    let (mut master, handles) = master_with_workers(2, Arc::new(Demo)).await;
    master.master_works(false);
    for i in 0..50 {
        master.submit(i, whoami()).await.unwrap();
    }
    master.done().await.unwrap();
    assert_eq!(master.server().unwrap().ready_len(), 0);
    finish(master, handles).await;
}

#[tokio::test]
async fn master_works_can_be_configured_off() {
    let mut transports = mesh(2);
    let workers = transports.split_off(1);
    let master_transport = transports.pop().unwrap();
    let handles = spawn_workers(workers, Arc::new(Demo));

    let config = BoardConfig::builder().master_works(false).build();
    let mut master = Client::master(master_transport, Arc::new(Demo), config).unwrap();
    master.take("ready").await.unwrap();
    for i in 0..5 {
        master.submit(i, whoami()).await.unwrap();
    }
    let results = drain(&mut master).await;
    assert!(results.values().all(|&id| id == 1.0), "{results:?}");
    assert_eq!(master.stats().executed, 0);
    finish(master, handles).await;
}

#[tokio::test]
async fn waiting_takers_on_one_key_each_get_one_post() {
    let mut transports = mesh(3);
    let workers = transports.split_off(1);
    let master_transport = transports.pop().unwrap();

    let handles = workers
        .into_iter()
        .map(|transport| {
            tokio::spawn(async move {
                let mut client =
                    Client::join(transport, Arc::new(Demo), BoardConfig::default()).await?;
                let got = client.take("k").await?;
                client.post("got", got).await?;
                client.worker().await
            })
        })
        .collect();

    let mut master =
        Client::master(master_transport, Arc::new(Demo), BoardConfig::default()).unwrap();
    while master.server().unwrap().waiters("k") < 2 {
        master.look("k").await.unwrap();
        tokio::task::yield_now().await;
    }
    master.post("k", Buffer::from(&b"x"[..])).await.unwrap();
    master.post("k", Buffer::from(&b"y"[..])).await.unwrap();
    assert_eq!(master.server().unwrap().mailbox_len("k"), 0);

    let mut got = Vec::new();
    for _ in 0..2 {
        got.push(master.take("got").await.unwrap().to_vec());
    }
    got.sort();
    assert_eq!(got, vec![b"x".to_vec(), b"y".to_vec()]);
    finish(master, handles).await;
}
