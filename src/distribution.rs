//! Spreads the block coordinates of a repetition over nodes, and over threads within a node.
//!
//! Each node searches a contiguous, balanced share of the blocks; inside a node a rayon pool
//! splits that share again between workers. A worker owns its scratch and fold rankings and
//! only touches the node-wide rankings once, when its blocks are done. Non-root nodes ship
//! their fold rankings to the root as bincode frames through a `Transport`.

use crate::combination::BlockCombinations;
use crate::cv::CV;
use crate::error::{EpistasisError, Result};
use crate::experiment::RunContext;
use crate::kernel::Workspace;
use crate::model::{risky_cells, ConfusionMatrix, RiskyCombination};
use crate::param::EvaluationSubset;
use crate::ranking::Ranking;
use crate::utils::split_into_balanced_chunks;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// Scores every combination of the pending batch on every fold and offers the risky ones to
/// the fold rankings.
fn evaluate_batch(ctx: &RunContext, cv: &CV, ws: &mut Workspace, rankings: &mut [Ranking]) {
    let order = ctx.order();
    let epistasis = &ctx.param.epistasis;
    ws.count(&ctx.dataset);

    for slot in 0..ws.counts.len() {
        let combination = &ws.batch[slot * order..(slot + 1) * order];
        for (fold, ranking) in rankings.iter_mut().enumerate() {
            let (train_a, train_u) = ws.counts.training(slot, fold);
            let (_, total_a, total_u) = cv.training_sizes(fold);
            risky_cells(train_a, train_u, total_a, total_u, &mut ws.risky);
            if ws.risky.is_empty() {
                continue;
            }

            let cm = match epistasis.evaluation_subset {
                EvaluationSubset::training => {
                    ConfusionMatrix::from_cell_counts(&ws.risky, train_a, train_u, total_a, total_u)
                }
                EvaluationSubset::testing => {
                    let (test_a, test_u) = ws.counts.testing(slot, fold);
                    let (_, fold_a, fold_u) = cv.testing_sizes(fold);
                    ConfusionMatrix::from_cell_counts(&ws.risky, test_a, test_u, fold_a, fold_u)
                }
            };
            let score = cm.score(epistasis.evaluation_function);

            if ranking.accepts(score, combination) {
                ranking.insert(RiskyCombination::new(
                    combination.to_vec(),
                    ws.risky.clone(),
                    score,
                ));
            }
        }
    }
    ws.batch.clear();
}

/// Searches a run of blocks with private scratch and returns one ranking per fold.
pub fn search_blocks(ctx: &RunContext, cv: &CV, blocks: &[Vec<usize>]) -> Vec<Ranking> {
    let order = ctx.order();
    let epistasis = &ctx.param.epistasis;
    let mut ws = ctx.take_workspace(cv);
    let mut rankings = vec![Ranking::new(epistasis.max_ranking_size); cv.num_folds()];

    for block in blocks {
        debug!("Block {:?}", block);
        ws.kernel.load_block(&ctx.dataset, block, ctx.stride);
        let mut combinations = BlockCombinations::new(block, ctx.stride, ctx.dataset.num_variants());
        loop {
            let exhausted = match combinations.next_combination() {
                Some(c) => {
                    ws.batch.extend_from_slice(c);
                    false
                }
                None => true,
            };
            if ws.batch_is_full(order) || (exhausted && !ws.batch.is_empty()) {
                evaluate_batch(ctx, cv, &mut ws, &mut rankings);
            }
            if exhausted {
                break;
            }
        }
    }
    ctx.release_workspace(ws);
    rankings
}

fn lock_rankings(rankings: &Mutex<Vec<Ranking>>) -> MutexGuard<'_, Vec<Ranking>> {
    match rankings.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Searches the blocks of one node on `thread_number` workers and merges their rankings.
pub fn search_node(ctx: &RunContext, cv: &CV, blocks: Vec<Vec<usize>>, thread_number: usize) -> Result<Vec<Ranking>> {
    let capacity = ctx.param.epistasis.max_ranking_size;
    let global = Mutex::new(vec![Ranking::new(capacity); cv.num_folds()]);
    let worker_blocks = split_into_balanced_chunks(blocks, thread_number);

    let thread_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(thread_number)
        .build()
        .map_err(|e| EpistasisError::config(format!("Can't build a pool of {} threads: {}", thread_number, e)))?;

    thread_pool.install(|| {
        worker_blocks.par_iter().enumerate().for_each(|(worker, blocks)| {
            let local = search_blocks(ctx, cv, blocks);
            debug!("Worker {} done with {} blocks", worker, blocks.len());
            let mut guard = lock_rankings(&global);
            for (g, l) in guard.iter_mut().zip(local) {
                g.merge(l);
            }
        })
    });

    Ok(match global.into_inner() {
        Ok(rankings) => rankings,
        Err(poisoned) => poisoned.into_inner(),
    })
}

/// One model as it travels between nodes
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WireModel {
    pub accuracy: f64,
    pub order: usize,
    pub combination: Vec<usize>,
    pub risky_genotypes: Vec<usize>,
}

/// The ranking of one fold, sent by a node to the root
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RankingMessage {
    pub source: usize,
    pub repetition: usize,
    pub fold: usize,
    pub models: Vec<WireModel>,
}

impl RankingMessage {
    pub fn from_ranking(source: usize, repetition: usize, fold: usize, ranking: &Ranking) -> RankingMessage {
        RankingMessage {
            source,
            repetition,
            fold,
            models: ranking
                .to_sorted_vec()
                .into_iter()
                .map(|m| WireModel {
                    accuracy: m.accuracy,
                    order: m.order(),
                    combination: m.combination,
                    risky_genotypes: m.risky_genotypes,
                })
                .collect(),
        }
    }

    pub fn into_ranking(self, capacity: usize) -> Result<Ranking> {
        let mut ranking = Ranking::new(capacity);
        for model in self.models {
            if model.combination.len() != model.order {
                return Err(EpistasisError::transport(format!(
                    "node {} sent a model of order {} holding {} variants",
                    self.source,
                    model.order,
                    model.combination.len()
                )));
            }
            ranking.insert(RiskyCombination::new(model.combination, model.risky_genotypes, model.accuracy));
        }
        Ok(ranking)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<RankingMessage> {
        bincode::deserialize(bytes).map_err(|e| EpistasisError::transport(format!("undecodable ranking frame: {}", e)))
    }
}

/// Moves ranking messages from the nodes to the root (rank 0).
pub trait Transport: Send {
    fn rank(&self) -> usize;
    fn send(&self, message: &RankingMessage) -> Result<()>;
    /// Next message addressed to this node; fails once every sender is gone
    fn recv(&self) -> Result<RankingMessage>;
}

/// In-process transport: byte frames over a crossbeam channel.
pub struct ChannelTransport {
    rank: usize,
    to_root: Option<Sender<Vec<u8>>>,
    inbox: Option<Receiver<Vec<u8>>>,
}

impl ChannelTransport {
    /// One endpoint per node; only the root can receive, only the others can send.
    pub fn cluster(num_nodes: usize) -> Vec<ChannelTransport> {
        let (sender, receiver) = unbounded();
        let mut endpoints = vec![ChannelTransport {
            rank: 0,
            to_root: None,
            inbox: Some(receiver),
        }];
        for rank in 1..num_nodes {
            endpoints.push(ChannelTransport {
                rank,
                to_root: Some(sender.clone()),
                inbox: None,
            });
        }
        endpoints
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn send(&self, message: &RankingMessage) -> Result<()> {
        let sender = self
            .to_root
            .as_ref()
            .ok_or_else(|| EpistasisError::transport("the root node does not send rankings"))?;
        sender
            .send(message.encode()?)
            .map_err(|_| EpistasisError::transport(format!("root is gone, node {} can't send", self.rank)))
    }

    fn recv(&self) -> Result<RankingMessage> {
        let inbox = self
            .inbox
            .as_ref()
            .ok_or_else(|| EpistasisError::transport(format!("node {} has no inbox", self.rank)))?;
        let frame = inbox
            .recv()
            .map_err(|_| EpistasisError::transport("every node hung up before sending its rankings"))?;
        RankingMessage::decode(&frame)
    }
}

fn run_node(ctx: &RunContext, cv: &CV, transport: ChannelTransport, blocks: Vec<Vec<usize>>, repetition: usize) -> Result<()> {
    let rankings = search_node(ctx, cv, blocks, ctx.param.general.thread_number)?;
    for (fold, ranking) in rankings.iter().enumerate() {
        transport.send(&RankingMessage::from_ranking(transport.rank(), repetition, fold, ranking))?;
    }
    Ok(())
}

/// Searches every block of the run for one repetition and returns the global ranking of
/// each fold. The result does not depend on the number of nodes or threads.
pub fn search_repetition(ctx: &RunContext, cv: &CV, repetition: usize) -> Result<Vec<Ranking>> {
    let num_nodes = ctx.param.distribution.num_nodes;
    let thread_number = ctx.param.general.thread_number;
    let capacity = ctx.param.epistasis.max_ranking_size;

    let node_blocks = split_into_balanced_chunks(ctx.block_coordinates.clone(), num_nodes);
    info!(
        "Repetition {}: {} blocks over {} node(s) x {} thread(s)",
        repetition,
        ctx.block_coordinates.len(),
        num_nodes,
        thread_number
    );

    let mut endpoints = ChannelTransport::cluster(num_nodes).into_iter();
    let mut shares = node_blocks.into_iter();
    let root = endpoints.next().ok_or_else(|| EpistasisError::config("no node to run on"))?;
    let root_blocks = shares.next().unwrap_or_default();

    std::thread::scope(|s| {
        let handles: Vec<_> = endpoints
            .zip(shares)
            .map(|(transport, blocks)| {
                let rank = transport.rank();
                (rank, s.spawn(move || run_node(ctx, cv, transport, blocks, repetition)))
            })
            .collect();

        let mut global = search_node(ctx, cv, root_blocks, thread_number)?;

        for (rank, handle) in handles {
            handle
                .join()
                .map_err(|_| EpistasisError::transport(format!("node {} panicked", rank)))??;
        }

        for _ in 0..(num_nodes - 1) * cv.num_folds() {
            let message = root.recv()?;
            if message.repetition != repetition || message.fold >= global.len() {
                return Err(EpistasisError::transport(format!(
                    "node {} sent fold {} of repetition {} while collecting repetition {}",
                    message.source, message.fold, message.repetition, repetition
                )));
            }
            let fold = message.fold;
            debug!("Root merging fold {} from node {}", fold, message.source);
            global[fold].merge(message.into_ranking(capacity)?);
        }

        Ok(global)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{pack, GenotypeDataset};
    use crate::param::{KernelKind, Param};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn noisy_context(param: &Param) -> RunContext {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let rows: Vec<Vec<u8>> = (0..9)
            .map(|_| (0..40).map(|_| rng.gen_range(0..3u8)).collect())
            .collect();
        let dataset = GenotypeDataset::from_packed("noisy", pack(18, 22, &rows)).unwrap();
        RunContext::new(param, dataset).unwrap()
    }

    fn base_param() -> Param {
        let mut param = Param::default();
        param.epistasis.order = 2;
        param.epistasis.stride = 3;
        param.epistasis.num_folds = 4;
        param.epistasis.max_ranking_size = 5;
        param.epistasis.combinations_per_batch = 4;
        param
    }

    fn flatten(rankings: Vec<Ranking>) -> Vec<Vec<RiskyCombination>> {
        rankings.into_iter().map(|r| r.into_sorted_vec()).collect()
    }

    #[test]
    fn test_workers_and_nodes_do_not_change_rankings() {
        let param = base_param();
        let ctx = noisy_context(&param);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let cv = CV::new(18, 22, 4, &mut rng);

        let single = flatten(search_repetition(&ctx, &cv, 1).unwrap());
        assert!(single.iter().all(|r| r.len() == 5));

        let mut spread = base_param();
        spread.general.thread_number = 3;
        spread.distribution.num_nodes = 2;
        let ctx_spread = noisy_context(&spread);
        let many = flatten(search_repetition(&ctx_spread, &cv, 1).unwrap());

        assert_eq!(single, many);
    }

    #[test]
    fn test_workspaces_are_reused_across_repetitions() {
        let param = base_param();
        let ctx = noisy_context(&param);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for repetition in 1..=3 {
            let cv = CV::new(18, 22, 4, &mut rng);
            search_repetition(&ctx, &cv, repetition).unwrap();
            assert_eq!(ctx.idle_workspace_count(), 1);
        }

        let mut spread = base_param();
        spread.general.thread_number = 3;
        spread.distribution.num_nodes = 2;
        let ctx_spread = noisy_context(&spread);
        for repetition in 1..=3 {
            let cv = CV::new(18, 22, 4, &mut rng);
            search_repetition(&ctx_spread, &cv, repetition).unwrap();
            let idle = ctx_spread.idle_workspace_count();
            assert!((1..=6).contains(&idle), "{} workspaces", idle);
        }
    }

    #[test]
    fn test_scalar_and_bitsliced_search_agree() {
        let param = base_param();
        let ctx = noisy_context(&param);
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let cv = CV::new(18, 22, 4, &mut rng);
        let bitsliced = flatten(search_node(&ctx, &cv, ctx.block_coordinates.clone(), 1).unwrap());

        let mut scalar_param = base_param();
        scalar_param.epistasis.kernel = KernelKind::scalar;
        let scalar_ctx = noisy_context(&scalar_param);
        let scalar = flatten(search_node(&scalar_ctx, &cv, scalar_ctx.block_coordinates.clone(), 2).unwrap());

        assert_eq!(bitsliced, scalar);
    }

    #[test]
    fn test_message_round_trip_through_channel() {
        let mut ranking = Ranking::new(3);
        ranking.insert(RiskyCombination::new(vec![1, 4], vec![2, 8], 0.75));
        ranking.insert(RiskyCombination::new(vec![0, 2], vec![0], 0.6));

        let endpoints = ChannelTransport::cluster(2);
        endpoints[1]
            .send(&RankingMessage::from_ranking(1, 2, 3, &ranking))
            .unwrap();
        let message = endpoints[0].recv().unwrap();
        assert_eq!((message.source, message.repetition, message.fold), (1, 2, 3));
        assert_eq!(message.models[0].order, 2);
        assert_eq!(
            message.into_ranking(3).unwrap().into_sorted_vec(),
            ranking.into_sorted_vec()
        );
    }

    #[test]
    fn test_root_cannot_send_and_workers_cannot_receive() {
        let endpoints = ChannelTransport::cluster(2);
        let message = RankingMessage::from_ranking(0, 1, 0, &Ranking::new(1));
        assert!(matches!(endpoints[0].send(&message), Err(EpistasisError::Transport(_))));
        assert!(matches!(endpoints[1].recv(), Err(EpistasisError::Transport(_))));
    }

    #[test]
    fn test_inconsistent_wire_model_is_rejected() {
        let message = RankingMessage {
            source: 3,
            repetition: 1,
            fold: 0,
            models: vec![WireModel {
                accuracy: 0.9,
                order: 3,
                combination: vec![1, 2],
                risky_genotypes: vec![0],
            }],
        };
        let err = message.into_ranking(2).unwrap_err();
        assert!(err.to_string().contains("node 3"));
        assert!(RankingMessage::decode(&[1, 2, 3]).is_err());
    }
}
