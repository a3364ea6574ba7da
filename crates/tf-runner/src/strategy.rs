//! Demo model, adapter and analyzer.
//!
//! These stand in for a trained model and a real analysis service so the
//! worker runs end to end. The model emits `[momentum, range]` per bar, the
//! adapter squashes momentum into a score in (-1, 1), and the analyzer turns
//! strong scores into orders.

use tf_core::error::StageError;
use tf_core::{Action, OrderEvent, Payload, PayloadKind, Prediction, StockAggregate, Task, Transaction};
use tf_pipeline::{FnTransform, TransformStage};

/// Scores below this magnitude produce no order.
pub const SIGNAL_THRESHOLD: f64 = 0.2;

/// Aggregate → `ModelOutput([momentum, range])`.
pub fn model() -> TransformStage {
    TransformStage::new(
        "model",
        FnTransform::new(PayloadKind::Aggregate, PayloadKind::ModelOutput, |p| match p {
            Payload::Aggregate(bar) => Ok(Some(Payload::ModelOutput(features(&bar)?))),
            other => Err(unexpected(&other)),
        }),
    )
}

/// `ModelOutput` → `Prediction`.
pub fn adapter() -> TransformStage {
    TransformStage::new(
        "adapter",
        FnTransform::new(PayloadKind::ModelOutput, PayloadKind::Prediction, |p| match p {
            Payload::ModelOutput(out) => Ok(Some(Payload::Prediction(Prediction {
                score: squash(momentum(&out)?),
            }))),
            other => Err(unexpected(&other)),
        }),
    )
}

/// `Pair` → `OrderEvent`, dropping weak signals.
///
/// Accepts either an adapted `Prediction` or raw `ModelOutput` as the model
/// half, so it works in both topologies.
pub fn analyzer(product_id: &str, task: Task) -> TransformStage {
    let product_id = product_id.to_string();
    TransformStage::new(
        "analyze",
        FnTransform::new(PayloadKind::Pair, PayloadKind::OrderEvent, move |p| {
            let pair = match p {
                Payload::Pair(pair) => pair,
                other => return Err(unexpected(&other)),
            };
            let Payload::Aggregate(bar) = &pair.ref_data else {
                return Err(unexpected(&pair.ref_data));
            };
            let score = match &pair.model_data {
                Payload::Prediction(prediction) => prediction.score,
                Payload::ModelOutput(out) => squash(momentum(out)?),
                other => return Err(unexpected(other)),
            };
            Ok(decide(score).map(|transaction| {
                Payload::OrderEvent(OrderEvent {
                    product_id: product_id.clone(),
                    transaction,
                    timestamp: bar.closed_time,
                    task,
                })
            }))
        }),
    )
}

fn features(bar: &StockAggregate) -> Result<Vec<f64>, StageError> {
    if bar.open <= 0.0 {
        return Err(StageError::Transform(format!("bar at {} has open price {}", bar.open_time, bar.open)));
    }
    let open = f64::from(bar.open);
    let momentum = (f64::from(bar.closed) - open) / open;
    let range = (f64::from(bar.high) - f64::from(bar.low)) / open;
    Ok(vec![momentum, range])
}

fn momentum(out: &[f64]) -> Result<f64, StageError> {
    out.first()
        .copied()
        .ok_or_else(|| StageError::Transform("empty model output".to_string()))
}

fn squash(momentum: f64) -> f64 {
    (momentum * 100.0).tanh()
}

fn decide(score: f64) -> Option<Transaction> {
    if score.abs() < SIGNAL_THRESHOLD {
        return None;
    }
    let action = if score > 0.0 { Action::Buy } else { Action::Sell };
    let proportion_percent = ((score.abs() * 100.0).round() as i32).clamp(1, 100);
    Some(Transaction {
        proportion_percent,
        action,
    })
}

fn unexpected(payload: &Payload) -> StageError {
    StageError::Transform(format!("unexpected {} payload", payload.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f32, closed: f32) -> StockAggregate {
        StockAggregate {
            open_time: 0,
            closed_time: 60,
            open,
            closed,
            high: open.max(closed) + 1.0,
            low: open.min(closed) - 1.0,
            volume: 1_000.0,
        }
    }

    #[test]
    fn features_measure_momentum_and_range() {
        let out = features(&bar(100.0, 101.0)).unwrap();
        assert!((out[0] - 0.01).abs() < 1e-9);
        assert!((out[1] - 0.03).abs() < 1e-6);
        assert!(features(&bar(0.0, 1.0)).is_err());
    }

    #[test]
    fn weak_signals_are_dropped() {
        assert_eq!(decide(0.1), None);
        assert_eq!(decide(-0.19), None);
    }

    #[test]
    fn strong_signals_become_orders() {
        let buy = decide(squash(0.01)).unwrap();
        assert_eq!(buy.action, Action::Buy);
        assert_eq!(buy.proportion_percent, 76);

        let sell = decide(-1.0).unwrap();
        assert_eq!(sell.action, Action::Sell);
        assert_eq!(sell.proportion_percent, 100);
    }

    #[test]
    fn empty_model_output_is_an_error() {
        assert!(matches!(momentum(&[]), Err(StageError::Transform(_))));
    }
}
