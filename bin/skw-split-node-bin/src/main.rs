use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};

use skw_split_channel::InMemoryChannel;
use skw_split_node::{PolynomialLinear, RoundCoordinator, SplitConfig};
use skw_split_payload::Tensor;

// input -> cut layer -> output
const INPUTS: usize = 784;
const CUT: usize = 128;
const OUTPUTS: usize = 10;

const DEFAULT_ROUNDS: u64 = 10;

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let config = match SplitConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };
    let rounds = match dotenv::var("SKW_SPLIT_ROUNDS") {
        Ok(v) => match v.trim().parse::<u64>() {
            Ok(rounds) => rounds,
            Err(e) => {
                log::error!("SKW_SPLIT_ROUNDS: {}", e);
                std::process::exit(1);
            }
        },
        Err(_) => DEFAULT_ROUNDS,
    };

    let channel = InMemoryChannel::spawn(config.max_payload_bytes);
    let coordinator = match RoundCoordinator::from_config(
        config.clone(),
        Arc::new(PolynomialLinear::new(INPUTS, CUT, config.learning_rate)),
        Arc::new(PolynomialLinear::new(CUT, OUTPUTS, config.learning_rate)),
        Arc::new(channel.clone()),
    ) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    log::info!(
        "running {} rounds between {} and {}",
        rounds, config.segment_a, config.segment_b
    );

    let mut rng = StdRng::seed_from_u64(config.seed);
    // placeholder label, broadcast over the output
    let target = Tensor::vector(vec![1.0]);
    let mut complete = 0;
    for _ in 0..rounds {
        let input = Tensor::vector((0..INPUTS).map(|_| rng.gen::<f32>()).collect());
        let result = coordinator.run_round(&input, &target).await;
        if result.is_complete() {
            complete += 1;
        }

        match serde_json::to_string(&result) {
            Ok(report) => log::info!("{}", report),
            Err(e) => log::warn!("cannot encode report for round {}: {}", result.round_id(), e),
        }
    }

    log::info!("{} of {} rounds complete", complete, rounds);
    if let Err(e) = channel.shutdown().await {
        log::warn!("ledger did not shut down cleanly: {}", e);
    }
}
