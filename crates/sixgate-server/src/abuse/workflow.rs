//! Abuse pattern workflow.
//!
//! When a bad-reputation client connects, the proxy samples its opening
//! bytes instead of serving it. A sample is only interesting when the
//! client kept the socket open and sent *something*: the read must end by
//! deadline, not by EOF or a full buffer. Known-confirmed patterns
//! trigger a report; unknown patterns from sufficiently bad IPs are
//! upserted for an operator to review. All errors here are logged and
//! swallowed — the connection is being dropped either way.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use md5::{Digest, Md5};
use sixgate_core::SixgateResult;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::warn;

use crate::abuse::reputation::ReputationClient;
use crate::abuse::store::{AbuseStore, KnownPattern};
use crate::config::Config;
use crate::logbatch::LogBatch;

/// Reputation floor (distinct from the blocking threshold) for admitting
/// brand-new patterns into the store.
const RECORD_MIN_SCORE: i64 = 90;

/// How often the background sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Sample and record the opening bytes of a blocked connection.
///
/// `peer` and `local` are the accepted socket's addresses; `local` is the
/// client's original destination thanks to the transparent listener.
pub async fn record_abusive_open<S>(
    stream: &mut S,
    peer: SocketAddr,
    local: SocketAddr,
    cfg: &Config,
    store: &AbuseStore,
    reputation: &ReputationClient,
    log: &mut LogBatch,
) where
    S: AsyncRead + Unpin,
{
    if let Err(e) = record_inner(stream, peer, local, cfg, store, reputation, log).await {
        log.push(format!("abuse recording error: {e}"));
    }
}

async fn record_inner<S>(
    stream: &mut S,
    peer: SocketAddr,
    local: SocketAddr,
    cfg: &Config,
    store: &AbuseStore,
    reputation: &ReputationClient,
    log: &mut LogBatch,
) -> SixgateResult<()>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + cfg.abuse_record_time;
    let mut buf = vec![0u8; cfg.abuse_record_length];
    let mut filled = 0usize;
    let mut deadline_hit = false;

    while filled < buf.len() {
        match timeout_at(deadline, stream.read(&mut buf[filled..])).await {
            Err(_) => {
                deadline_hit = true;
                break;
            }
            Ok(Ok(0)) => break, // clean close
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => {
                log.push(format!("read error while sampling: {e}"));
                return Ok(());
            }
        }
    }

    // a client that closed, sent nothing, or filled the whole window
    // before the deadline is not what this store is for
    if !deadline_hit {
        log.push("client did not idle inside the sampling window");
        return Ok(());
    }
    if filled == 0 {
        log.push("client sent no data within the sampling window");
        return Ok(());
    }

    let sample = &buf[..filled];
    let hash = hex::encode(Md5::digest(sample));
    log.push_bytes(&format!("sampled {filled} opening bytes, md5={hash}:"), sample);

    // a confirmed pattern means an operator already vetted these bytes:
    // report the sender and stop
    if let Some(pattern) = store.pattern_by_hash(&hash).await? {
        if pattern.confirmed {
            log.push(format!("client sent confirmed bad pattern {hash}"));
            let known = KnownPattern {
                hash: pattern.hash,
                category: pattern.category,
                comment: pattern.comment,
            };
            reputation.report(peer.ip(), &known, log).await;
            return Ok(());
        }
    }

    // unknown pattern: only keep it when the source is unambiguously bad
    let score = reputation.check(peer.ip(), log).await;
    if score < RECORD_MIN_SCORE {
        log.push(format!("score {score} below recording floor, dropping sample"));
        return Ok(());
    }

    let ip = peer.ip().to_string();
    let unconfirmed = store.count_unconfirmed_by_ip(&ip).await?;
    if unconfirmed >= cfg.abuse_patterns_per_ip {
        log.push("too many unconfirmed patterns from this IP");
        return Ok(());
    }

    store
        .upsert_unconfirmed(
            &hash,
            &ip,
            local.port(),
            sample.to_vec(),
            cfg.abuse_pattern_expire,
            cfg.abuse_save_pattern_after,
        )
        .await?;
    log.push(format!("recorded pattern {hash} from {ip}"));
    Ok(())
}

/// Occupy a blocked client with a slow byte drip. Optional policy knob,
/// off by default; ends after a minute or on the first write error.
pub async fn annoy<W>(stream: &mut W)
where
    W: AsyncWrite + Unpin,
{
    for _ in 0..60 {
        sleep(Duration::from_secs(1)).await;
        if stream.write_all(b".").await.is_err() {
            return;
        }
        if stream.flush().await.is_err() {
            return;
        }
    }
}

/// Spawn the periodic sweeper: stale reputation rows and expired
/// unconfirmed patterns are deleted on every pass.
pub fn spawn_sweeper(store: Arc<AbuseStore>, ip_expire: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = store.sweep(ip_expire).await {
                warn!(error = %e, "abuse store sweep failed");
            }
        }
    })
}
