//! Coordinates incremental synchronization of the unspent mweb output
//! set.

use crate::banman::{BanManager, Reason};
use crate::diff::diff_leafsets;
use crate::dispatcher::{Progress, QueryDispatcher, QueryError, Request, ResponseHandler};
use crate::store::{CoinStore, HeaderStore, StoreError};
use crate::utxo_verifier::verify_mweb_utxos;
use crate::PeerId;
use async_trait::async_trait;
use bitcoin::block::Header as BlockHeader;
use mweb_primitives::mmr::LeafIdx;
use mweb_primitives::{
    BlockMeta, Leafset, Message, MsgGetMwebUtxos, MsgMwebUtxos, MwebHeader, OutputFormat, Utxo,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Subscriber invoked with each committed batch of verified utxos.
pub type UtxosCallback = Box<dyn Fn(&Leafset, &[Utxo], &BlockMeta) + Send + Sync>;

/// Drives the mweb utxo set forward as the base chain advances.
///
/// Verification is delegated to the pure [`crate::verify_mweb_header`]
/// and [`crate::verify_mweb_utxos`] functions; this type owns the
/// pending query state for the duration of a single sync,
/// reassembles responses in ascending start-index order and serializes
/// subscriber notifications.
pub struct MwebSyncManager {
    coins: Arc<dyn CoinStore>,
    headers: Arc<dyn HeaderStore>,
    dispatcher: Arc<dyn QueryDispatcher>,
    banman: Arc<dyn BanManager>,
    /// Held across the entire commit loop so that callback registration
    /// cannot interleave with a partially committed sync.
    utxos_callbacks: Mutex<Vec<UtxosCallback>>,
    shutdown: CancellationToken,
}

impl MwebSyncManager {
    /// Constructs a new manager around the external collaborators.
    pub fn new(
        coins: Arc<dyn CoinStore>,
        headers: Arc<dyn HeaderStore>,
        dispatcher: Arc<dyn QueryDispatcher>,
        banman: Arc<dyn BanManager>,
    ) -> Self {
        Self {
            coins,
            headers,
            dispatcher,
            banman,
            utxos_callbacks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token observed by every suspension point of the coordinator;
    /// cancelling it abandons in-flight syncs without persisting
    /// partial work.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Registers a subscriber for committed utxo batches.
    ///
    /// Subscribers observe commits in strictly ascending start-index
    /// order and are never called with unverified data.
    pub async fn register_utxos_callback(&self, callback: UtxosCallback) {
        self.utxos_callbacks.lock().await.push(callback);
    }

    /// Fetches, verifies and commits the utxos added since the
    /// persisted leafset, then purges the spent leaves.
    ///
    /// `mweb_header` and `new_leafset` must have passed
    /// [`crate::verify_mweb_header`] for the block at `last_header`.
    ///
    /// # Panics
    ///
    /// Panics if the coin store fails; a read or write failure there
    /// indicates local corruption, not peer misbehavior.
    pub async fn sync_utxos(
        &self,
        mweb_header: &MwebHeader,
        new_leafset: Leafset,
        last_height: u32,
        last_header: &BlockHeader,
    ) {
        tracing::info!(
            height = last_height,
            hash = %last_header.block_hash(),
            "Fetching set of mweb utxos",
        );

        let new_num_leaves = mweb_header.output_mmr_size;
        let (old_leafset, old_num_leaves) = match self.coins.leaf_set() {
            Ok(leaf_set) => leaf_set,
            Err(err) => panic!("couldn't read mweb coins db: {err}"),
        };

        let diff = diff_leafsets(&old_leafset, old_num_leaves, &new_leafset, new_num_leaves);

        if diff.added.is_empty() {
            self.purge_spent_utxos(&new_leafset, new_num_leaves, &diff.removed);
            return;
        }

        let query_msgs: Vec<Message> = diff
            .added
            .iter()
            .map(|span| {
                Message::GetMwebUtxos(MsgGetMwebUtxos {
                    block_hash: last_header.block_hash(),
                    start_index: span.start,
                    num_requested: span.count,
                    output_format: OutputFormat::Compact,
                })
            })
            .collect();

        tracing::info!(
            start_index = diff.added[0].start,
            batches = query_msgs.len(),
            "Attempting to query for mwebutxos batches",
        );

        // Hand the whole batch to the work manager at once; it shards
        // the requests among the active peers. Verified responses land
        // on `utxos_rx` in arrival order.
        let (utxos_tx, mut utxos_rx) = mpsc::channel(query_msgs.len());
        let handler: Arc<dyn ResponseHandler> = Arc::new(MwebUtxosQuery {
            mweb_header: mweb_header.clone(),
            leafset: new_leafset.clone(),
            utxos_tx,
            banman: self.banman.clone(),
            shutdown: self.shutdown.clone(),
        });
        let requests = query_msgs
            .into_iter()
            .map(|req| Request {
                req,
                handler: handler.clone(),
            })
            .collect();
        drop(handler);

        let mut err_rx = self.dispatcher.query(requests, self.shutdown.child_token());

        let callbacks = self.utxos_callbacks.lock().await;

        let block = BlockMeta {
            hash: last_header.block_hash(),
            height: last_height,
            time: last_header.time,
        };

        // Reassemble out-of-order responses, committing them strictly
        // ascending by start index.
        let mut query_responses: HashMap<u64, MsgMwebUtxos> =
            HashMap::with_capacity(diff.added.len());
        let mut total_utxos = 0usize;
        let mut query_done = false;
        let mut i = 0usize;

        while i < diff.added.len() {
            let response = tokio::select! {
                maybe_response = utxos_rx.recv() => {
                    match maybe_response {
                        Some(response) => response,
                        // Every sender is gone without completing the
                        // plan; nothing more can arrive.
                        None => return,
                    }
                }
                maybe_err = err_rx.recv(), if !query_done => {
                    match maybe_err {
                        Some(Err(QueryError::WorkManagerShuttingDown)) => return,
                        Some(Err(err)) => {
                            tracing::error!(
                                %err,
                                "Query finished with error before all responses received",
                            );
                            return;
                        }
                        // The query finished successfully; keep draining
                        // the responses already sent on the channel.
                        Some(Ok(())) | None => {
                            query_done = true;
                            continue;
                        }
                    }
                }
                _ = self.shutdown.cancelled() => return,
            };

            let start_index = first_leaf_index(&response);
            let last_index = last_leaf_index(&response);
            let cur_index = diff.added[i].start;

            tracing::debug!(
                start_index,
                last_index,
                block_hash = %response.block_hash,
                "Got mwebutxos",
            );

            // Out-of-order reply for a span that was already written.
            if last_index < cur_index {
                tracing::debug!(last_index, "Received out of order reply, already written");
                continue;
            }

            // A response straddling the commit frontier cannot match
            // any planned span; drop it without banning.
            if start_index < cur_index {
                tracing::debug!(
                    start_index,
                    cur_index,
                    "Discarding response straddling the commit frontier",
                );
                continue;
            }

            if start_index > cur_index {
                tracing::debug!(start_index, cur_index, "Response arrived early, stashing");
            }

            query_responses.insert(start_index, response);

            // Cycle through the cached responses for as long as the
            // next expected span is available.
            while i < diff.added.len() {
                let Some(response) = query_responses.remove(&diff.added[i].start) else {
                    break;
                };

                tracing::debug!(index = diff.added[i].start, "Writing mwebutxos");

                if let Err(err) = self.coins.put_coins(&response.utxos) {
                    panic!("couldn't write mweb coins: {err}");
                }

                for callback in callbacks.iter() {
                    callback(&new_leafset, &response.utxos, &block);
                }

                total_utxos += response.utxos.len();
                i += 1;
            }
        }

        tracing::info!(total_utxos, "Successfully got mweb utxos");

        self.purge_spent_utxos(&new_leafset, new_num_leaves, &diff.removed);
    }

    /// Installs the new leafset and deletes the spent records.
    fn purge_spent_utxos(&self, new_leafset: &Leafset, new_num_leaves: u64, removed: &[u64]) {
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Purging spent mweb txos from db");
        }
        if let Err(err) = self
            .coins
            .put_leaf_set_and_purge(new_leafset, new_num_leaves, removed)
        {
            panic!("couldn't purge mweb txos: {err}");
        }
    }

    /// Replays subscriber callbacks for leaves added to the persisted
    /// leafset since `snapshot`, without touching the network.
    pub async fn notify_added_utxos(&self, snapshot: &Leafset) -> Result<(), StoreError> {
        let callbacks = self.utxos_callbacks.lock().await;

        let (new_leafset, new_num_leaves) = self.coins.leaf_set()?;

        // Skip over the common byte prefix.
        let (old_bytes, new_bytes) = (snapshot.as_bytes(), new_leafset.as_bytes());
        let mut byte_idx = 0;
        while byte_idx < old_bytes.len()
            && byte_idx < new_bytes.len()
            && old_bytes[byte_idx] == new_bytes[byte_idx]
        {
            byte_idx += 1;
        }

        let mut added_leaves = Vec::new();
        for i in (byte_idx as u64 * 8)..new_num_leaves {
            if !snapshot.contains(LeafIdx(i)) && new_leafset.contains(LeafIdx(i)) {
                added_leaves.push(i);
            }
        }

        let utxos = self.coins.fetch_leaves(&added_leaves)?;
        let (header, height) = self.headers.chain_tip()?;

        let block = BlockMeta {
            hash: header.block_hash(),
            height,
            time: header.time,
        };
        for callback in callbacks.iter() {
            callback(&new_leafset, &utxos, &block);
        }

        Ok(())
    }
}

fn first_leaf_index(response: &MsgMwebUtxos) -> u64 {
    response
        .utxos
        .first()
        .expect("verified responses are non-empty; qed")
        .leaf_index
}

fn last_leaf_index(response: &MsgMwebUtxos) -> u64 {
    response
        .utxos
        .last()
        .expect("verified responses are non-empty; qed")
        .leaf_index
}

/// Per-sync response handler handed to the query dispatcher.
///
/// Invoked concurrently from the dispatcher's peer workers; every
/// response delivered on the channel has passed full proof verification.
struct MwebUtxosQuery {
    mweb_header: MwebHeader,
    leafset: Leafset,
    utxos_tx: mpsc::Sender<MsgMwebUtxos>,
    banman: Arc<dyn BanManager>,
    shutdown: CancellationToken,
}

#[async_trait]
impl ResponseHandler for MwebUtxosQuery {
    async fn handle_response(&self, req: &Message, resp: &Message, peer: PeerId) -> Progress {
        // We are only looking for mwebutxos messages.
        let Message::MwebUtxos(response) = resp else {
            return Progress::rejected();
        };

        // We sent a getmwebutxos message, so that's what we should be
        // comparing against.
        let Message::GetMwebUtxos(request) = req else {
            return Progress::rejected();
        };

        // The response doesn't match the query.
        if request.block_hash != response.block_hash
            || request.start_index != response.start_index
            || request.output_format != response.output_format
            || usize::from(request.num_requested) != response.utxos.len()
        {
            return Progress::rejected();
        }

        if !verify_mweb_utxos(&self.mweb_header, &self.leafset, response) {
            tracing::warn!(
                start_index = response.start_index,
                ?peer,
                "Failed to verify mweb utxos",
            );

            // A peer serving a bad mwebutxos message is banned so that
            // the query can be re-allocated elsewhere.
            if let Err(err) = self.banman.ban_peer(peer, Reason::InvalidMwebUtxos) {
                tracing::error!(?peer, %err, "Unable to ban peer");
            }

            return Progress::rejected();
        }

        // Deliver the verified response, unless shutdown wins the race.
        tokio::select! {
            result = self.utxos_tx.send(response.clone()) => {
                if result.is_err() {
                    return Progress::rejected();
                }
            }
            _ = self.shutdown.cancelled() => return Progress::rejected(),
        }

        Progress::completed()
    }
}
