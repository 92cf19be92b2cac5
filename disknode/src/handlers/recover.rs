use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{Payload, RecoverPlan, RecoverSource, Request, Response, Seq};
use tracing::{debug, info, instrument, warn};

use super::NodeState;
use crate::server::{HandlerError, MessageHandler};

/// records asked from a peer in one request, keeps responses well below
/// the frame limit
const BATCH: usize = 32;

/// Bring this replica up to the sequence numbers in the plan by pulling
/// what is missing from the listed peers. Answers `false` if some records
/// could not be found on any reachable peer.
pub(crate) struct Recover(pub Arc<NodeState>);

#[async_trait]
impl MessageHandler for Recover {
    #[instrument(skip_all, fields(path = %req.path))]
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let plan = RecoverPlan::from_body(&req.body)?;
        let path = req.path;
        let state = &self.0;

        let p = path.clone();
        state.on_disk(move |w| w.open(&p, None)).await?;
        let p = path.clone();
        let held = state
            .on_disk(move |w| w.sequence_info(&p))
            .await?
            .unwrap_or_default();

        let mut missing: BTreeSet<Seq> = plan.seqs.iter().copied().collect();
        for seq in &held.seqs {
            missing.remove(seq);
        }
        debug!("missing {} of {} records", missing.len(), plan.seqs.len());

        for source in &plan.sources {
            if missing.is_empty() {
                break;
            }
            if source.node == state.me {
                continue;
            }
            let added = pull_from(state, source, &path, &mut missing).await?;
            debug!("recovered {added} records from [{}]", source.node);
        }

        let p = path.clone();
        state.on_disk(move |w| w.flush(&p)).await?;
        if !missing.is_empty() {
            warn!("no reachable replica holds seqs: {missing:?}");
            return Ok(Response::flag(false));
        }
        info!("replica is complete");
        Ok(Response::flag(true))
    }
}

/// Unreachable peers are skipped, they are not an error for the recovery
/// as a whole.
async fn pull_from(
    state: &Arc<NodeState>,
    source: &RecoverSource,
    path: &str,
    missing: &mut BTreeSet<Seq>,
) -> Result<usize, HandlerError> {
    let Some(conn) = state.peers.get_connection(&source.node).await else {
        warn!("can not reach [{}] to recover from", source.node);
        return Ok(0);
    };

    let wanted: Vec<Seq> = missing.iter().copied().collect();
    let mut added = 0;
    for batch in wanted.chunks(BATCH) {
        let records = match conn.client().records(&source.path, batch.to_vec()).await {
            Ok(Some(records)) => records,
            Ok(None) => {
                debug!("[{}] does not have the file open", source.node);
                break;
            }
            Err(e) => {
                warn!("could not fetch records from [{}]: {e}", source.node);
                break;
            }
        };
        for record in &records {
            missing.remove(&record.seq);
        }
        let p = path.to_owned();
        added += state
            .on_disk(move |w| w.recover_records(&p, records))
            .await?;
    }
    Ok(added)
}
