//! End-to-end behavior of `VirtualFile` over the in-memory transport.
//!
//! The workloads mirror how a filesystem driver reads a disk image: mostly
//! sequential small reads, with occasional short and long seeks in both
//! directions.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use htfs::{
    Error, Fault, HtfsOptions, MemoryClient, PoolOptions, Renewer, RetryPolicy, SignedUrl,
    VirtualFile,
};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio_util::sync::CancellationToken;

const URL: &str = "https://storage.example.com/images/disk.img?sig=0";
const RENEWED: &str = "https://storage.example.com/images/disk.img?sig=1";
const MIB: usize = 1024 * 1024;
const MAX_READ: usize = 2739;

fn random_data(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

fn options() -> HtfsOptions {
    HtfsOptions::default().retry(RetryPolicy::immediate(4))
}

async fn open(client: &MemoryClient, options: HtfsOptions) -> VirtualFile<MemoryClient> {
    VirtualFile::open_with_client(client.clone(), URL, options)
        .await
        .unwrap()
}

async fn read_checked(file: &VirtualFile<MemoryClient>, data: &[u8], offset: u64, len: usize) {
    let mut buf = vec![0u8; len];
    let n = file.read_at(&mut buf, offset).await.unwrap();
    let start = offset as usize;
    let expected = &data[start..(start + len).min(data.len())];
    assert_eq!(n, expected.len(), "short read at {offset}");
    assert!(buf[..n] == *expected, "wrong bytes at {offset}+{len}");
}

/// Read positions in the proportions a disk-image consumer produces.
struct Workload {
    rng: StdRng,
    position: u64,
    size: u64,
}

impl Workload {
    fn new(seed: u64, size: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            position: 0,
            size,
        }
    }

    fn next(&mut self) -> (u64, usize) {
        let len = self.rng.gen_range(1..=MAX_READ);
        let position = self.position as i64;
        let target = match self.rng.gen_range(0..100u32) {
            0..80 => position,
            80..90 => position + self.rng.gen_range(1..1024),
            90..95 => position - self.rng.gen_range(1..1024),
            95..97 => position + self.rng.gen_range(MIB as i64..4 * MIB as i64),
            _ => position - self.rng.gen_range(MIB as i64..4 * MIB as i64),
        };
        let mut offset = target.clamp(0, self.size as i64 - 1) as u64;
        if offset + len as u64 > self.size {
            offset = 0;
        }
        self.position = offset + len as u64;
        (offset, len)
    }
}

#[tokio::test]
async fn test_sequential_reads_use_one_connection() {
    let data = random_data(32 * MIB, 1);
    let client = MemoryClient::new(data.clone());
    let file = open(&client, options()).await;

    let mut rng = StdRng::seed_from_u64(2);
    let mut offset = 0u64;
    for _ in 0..3000 {
        let len = rng.gen_range(1..=MAX_READ);
        read_checked(&file, &data, offset, len).await;
        offset += len as u64;
    }

    let stats = file.stats();
    assert_eq!(stats.conns_opened, 1);
    assert_eq!(stats.conns_reused, 2999);
    assert_eq!(stats.peak_conns, 1);
    assert_eq!(stats.bytes_served, offset);
    assert_eq!(file.num_conns(), 1);
    assert_eq!(client.peak_streams(), 1);
}

#[tokio::test]
async fn test_backward_seeks_open_more_connections_within_bound() {
    let data = random_data(32 * MIB, 3);
    let client = MemoryClient::new(data.clone());
    let file = open(&client, options()).await;

    let mut rng = StdRng::seed_from_u64(4);
    let mut offset = 0u64;
    for _ in 0..3000 {
        if rng.gen_bool(0.2) {
            offset = offset.saturating_sub(rng.gen_range(1..1024));
        }
        let len = rng.gen_range(1..=MAX_READ);
        read_checked(&file, &data, offset, len).await;
        offset += len as u64;
    }

    let stats = file.stats();
    assert!(stats.conns_opened > 1);
    assert!(stats.peak_conns <= 8);
    assert!(file.num_conns() <= 8);
    assert!(client.peak_streams() <= 8);
}

#[tokio::test]
async fn test_interleaved_sequential_readers_keep_their_connections() {
    let data = random_data(32 * MIB, 5);
    let client = MemoryClient::new(data.clone());
    let file = open(&client, options()).await;

    let mut cursors: Vec<u64> = (0..4).map(|i| i * 8 * MIB as u64).collect();
    for round in 0..500 {
        for cursor in cursors.iter_mut() {
            let len = 512 + round % 1024;
            read_checked(&file, &data, *cursor, len).await;
            *cursor += len as u64;
        }
    }

    let stats = file.stats();
    assert_eq!(stats.conns_opened, 4);
    assert_eq!(stats.conns_evicted, 0);
    assert_eq!(file.num_conns(), 4);
}

#[tokio::test]
async fn test_random_workload_matches_reference() {
    let data = random_data(32 * MIB, 6);
    let client = MemoryClient::new(data.clone());
    let file = open(&client, options()).await;

    let mut workload = Workload::new(7, data.len() as u64);
    for _ in 0..2000 {
        let (offset, len) = workload.next();
        read_checked(&file, &data, offset, len).await;
    }

    let stats = file.stats();
    assert!(stats.conns_reused > stats.conns_opened);
    assert!(stats.peak_conns <= 8);
    assert!(client.peak_streams() <= 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_respect_pool_bound() {
    let data = Arc::new(random_data(16 * MIB, 8));
    let client = MemoryClient::new(data.to_vec()).latency(Duration::from_millis(1));
    let file = Arc::new(open(&client, options().max_conns(4)).await);

    let tasks: Vec<_> = (0..16)
        .map(|seed| {
            let file = Arc::clone(&file);
            let data = Arc::clone(&data);
            tokio::spawn(async move {
                let mut workload = Workload::new(100 + seed, data.len() as u64);
                for _ in 0..200 {
                    let (offset, len) = workload.next();
                    read_checked(&file, &data, offset, len).await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert!(client.peak_streams() <= 4, "peak {}", client.peak_streams());
    assert!(file.stats().peak_conns <= 4);
    assert!(file.num_conns() <= 4);
}

#[tokio::test]
async fn test_errored_connection_is_never_reused() {
    let data = random_data(4 * MIB, 9);
    let client = MemoryClient::new(data.clone()).chunk_size(4096);
    let file = open(&client, options()).await;

    // request 1 is the probe
    client.inject(2, Fault::Reset);
    read_checked(&file, &data, 0, 64 * 1024).await;
    read_checked(&file, &data, 64 * 1024, 1000).await;

    let stats = file.stats();
    assert_eq!(stats.conns_opened, 2);
    assert_eq!(stats.conns_discarded, 1);
    assert_eq!(stats.retries, 1);
    assert_eq!(client.open_streams(), 1);

    client.inject(client.requests() + 1, Fault::Status(503));
    read_checked(&file, &data, 0, 10).await;
    assert_eq!(file.stats().retries, 2);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let data = random_data(MIB, 10);
    let client = MemoryClient::new(data);
    let file = open(&client, options()).await;
    for request in 2..=5 {
        client.inject(request, Fault::Status(503));
    }

    let mut buf = [0u8; 100];
    let err = file.read_at(&mut buf, 0).await.unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { attempts: 4, .. }));
    assert_eq!(err.status(), Some(503));
    assert_eq!(file.num_conns(), 0);

    // the next read starts a fresh budget
    file.read_at(&mut buf, 0).await.unwrap();
}

#[tokio::test]
async fn test_fatal_status_is_not_retried() {
    let data = random_data(MIB, 11);
    let client = MemoryClient::new(data);
    let file = open(&client, options()).await;
    client.inject(2, Fault::Status(404));

    let mut buf = [0u8; 100];
    let err = file.read_at(&mut buf, 0).await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert_eq!(client.requests(), 2);
}

#[tokio::test]
async fn test_eof_semantics() {
    let data = random_data(MIB, 12);
    let client = MemoryClient::new(data.clone());
    let file = open(&client, options()).await;
    let size = file.size();

    let mut buf = vec![0u8; 4096];
    assert_eq!(file.read_at(&mut buf, size - 100).await.unwrap(), 100);
    assert!(buf[..100] == data[data.len() - 100..]);
    assert_eq!(file.read_at(&mut buf, size).await.unwrap(), 0);
    assert!(matches!(
        file.read_at(&mut buf, size + 1).await,
        Err(Error::OutOfRange { .. })
    ));
}

#[derive(Default)]
struct CountingRenewer {
    calls: AtomicUsize,
    delay: Duration,
    /// Validity of each issued URL; unbounded when `None`.
    lifetime: Option<Duration>,
    fail: bool,
}

impl Renewer for CountingRenewer {
    fn renew(&self) -> BoxFuture<'_, htfs::Result<SignedUrl>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::Renewal("token service unavailable".into()));
            }
            let signed = SignedUrl::new(RENEWED);
            Ok(match self.lifetime {
                Some(lifetime) => signed.expires_at(Instant::now() + lifetime),
                None => signed,
            })
        })
    }
}

fn renewer(delay: Duration) -> Arc<CountingRenewer> {
    Arc::new(CountingRenewer {
        delay,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_url_rejected_mid_workload_is_renewed_once() {
    let data = random_data(32 * MIB, 13);
    let client = MemoryClient::new(data.clone());
    let renewer = renewer(Duration::ZERO);
    let file = open(&client, options().renewer(renewer.clone())).await;

    let mut rng = StdRng::seed_from_u64(14);
    let mut offset = 0u64;
    for i in 1..=1000 {
        if i == 500 {
            client.accept_only(RENEWED);
            // a long backward seek forces a new request on the expired URL
            offset = offset.saturating_sub(2 * MIB as u64);
        }
        let len = rng.gen_range(1..=MAX_READ);
        read_checked(&file, &data, offset, len).await;
        offset += len as u64;
    }

    assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(file.stats().renewals, 1);
    assert_eq!(file.url(), RENEWED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rejections_collapse_into_one_renewal() {
    let data = Arc::new(random_data(16 * MIB, 15));
    let client = MemoryClient::new(data.to_vec());
    let renewer = renewer(Duration::from_millis(50));
    let file = Arc::new(open(&client, options().renewer(renewer.clone())).await);
    client.accept_only(RENEWED);

    let tasks: Vec<_> = (0..8u64)
        .map(|i| {
            let file = Arc::clone(&file);
            let data = Arc::clone(&data);
            tokio::spawn(async move {
                read_checked(&file, &data, i * 2 * MIB as u64, 1000).await;
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(file.stats().renewals, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rejections_share_a_failed_renewal() {
    let data = Arc::new(random_data(16 * MIB, 21));
    let client = MemoryClient::new(data.to_vec());
    let renewer = Arc::new(CountingRenewer {
        delay: Duration::from_millis(50),
        fail: true,
        ..Default::default()
    });
    let file = Arc::new(open(&client, options().renewer(renewer.clone())).await);
    client.accept_only(RENEWED);

    let tasks: Vec<_> = (0..8u64)
        .map(|i| {
            let file = Arc::clone(&file);
            tokio::spawn(async move {
                let mut buf = [0u8; 1000];
                file.read_at(&mut buf, i * 2 * MIB as u64).await
            })
        })
        .collect();
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Renewal(_)), "{err}");
    }

    assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(file.stats().renewals, 0);
    assert_eq!(file.url(), URL);

    // the failure is not remembered for later reads
    let mut buf = [0u8; 10];
    assert!(file.read_at(&mut buf, 0).await.is_err());
    assert_eq!(renewer.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejection_without_renewer_is_fatal() {
    let data = random_data(MIB, 16);
    let client = MemoryClient::new(data);
    let file = open(&client, options()).await;
    client.accept_only(RENEWED);

    let mut buf = [0u8; 10];
    let err = file.read_at(&mut buf, 0).await.unwrap_err();
    assert!(matches!(err, Error::Renewal(_)));
}

#[tokio::test]
async fn test_expiring_url_is_renewed_before_use() {
    let data = random_data(MIB, 17);
    let client = MemoryClient::new(data.clone());
    client.accept_only(RENEWED);
    let renewer = renewer(Duration::ZERO);
    let options = options()
        .renewer(renewer.clone())
        .expires_at(Instant::now() + Duration::from_secs(1))
        .expiry_margin(Duration::from_secs(5));

    let file = open(&client, options).await;
    read_checked(&file, &data, 0, 100).await;

    assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
    // no request ever went out with the expiring URL
    assert_eq!(file.stats().retries, 0);
}

#[tokio::test]
async fn test_short_lived_urls_are_not_renewed_on_every_read() {
    let data = random_data(MIB, 22);
    let client = MemoryClient::new(data.clone());
    client.accept_only(RENEWED);
    let renewer = Arc::new(CountingRenewer {
        lifetime: Some(Duration::from_secs(3)),
        ..Default::default()
    });
    let options = options()
        .renewer(renewer.clone())
        .expires_at(Instant::now() + Duration::from_secs(1))
        .expiry_margin(Duration::from_secs(5));

    let file = open(&client, options).await;
    for i in 0..100u64 {
        read_checked(&file, &data, i * 100, 100).await;
    }

    assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(file.stats().renewals, 1);
    assert_eq!(file.stats().retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_connection_times_out_and_recovers() {
    let data = random_data(MIB, 18);
    let client = MemoryClient::new(data.clone());
    let file = open(&client, options().idle_timeout(Duration::from_secs(5))).await;
    client.inject(2, Fault::Stall);

    let started = tokio::time::Instant::now();
    read_checked(&file, &data, 0, 1000).await;

    assert!(started.elapsed() >= Duration::from_secs(5));
    let stats = file.stats();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.conns_discarded, 1);
    assert_eq!(client.open_streams(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_parent_token_cancels_reads() {
    let data = random_data(MIB, 19);
    let client = MemoryClient::new(data);
    let parent = CancellationToken::new();
    let file = Arc::new(
        open(
            &client,
            options()
                .idle_timeout(Duration::from_secs(3600))
                .cancellation(parent.clone()),
        )
        .await,
    );
    client.inject(2, Fault::Stall);

    let reader = Arc::clone(&file);
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 100];
        reader.read_at(&mut buf, 0).await
    });
    tokio::time::sleep(Duration::from_secs(10)).await;
    parent.cancel();

    assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(client.open_streams(), 0);
    let mut buf = [0u8; 100];
    assert!(matches!(file.read_at(&mut buf, 0).await, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_bounded_ranges_stitch_reads() {
    let data = random_data(MIB, 20);
    let client = MemoryClient::new(data.clone());
    let file = open(
        &client,
        options().pool(PoolOptions::default().max_range_len(Some(10_000))),
    )
    .await;

    read_checked(&file, &data, 5_000, 25_000).await;
    let stats = file.stats();
    assert_eq!(stats.conns_opened, 3);
    assert_eq!(stats.bytes_served, 25_000);
}
