//! Random order generation and the publishing loop behind `order-producer`.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{error, info};

use orderflow_core::{DomainResult, Order, OrderId, Price};
use orderflow_pipeline::ShutdownSignal;
use orderflow_stream::PublishSink;

pub const PRODUCTS: [&str; 5] = ["Item1", "Item2", "Item3", "Item4", "Item5"];

/// Prices are drawn uniformly from [MIN_PRICE_CENTS, MAX_PRICE_CENTS).
pub const MIN_PRICE_CENTS: u64 = 1_000;
pub const MAX_PRICE_CENTS: u64 = 100_000;

/// Builds random orders: fresh id, one of `PRODUCTS`, price in [10.00, 1000.00).
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderFactory;

impl OrderFactory {
    pub fn new() -> Self {
        Self
    }

    pub fn random_order(&self) -> DomainResult<Order> {
        let mut rng = rand::thread_rng();
        let product = PRODUCTS[rng.gen_range(0..PRODUCTS.len())];
        let price = Price::from_cents(rng.gen_range(MIN_PRICE_CENTS..MAX_PRICE_CENTS))?;
        Order::new(OrderId::new(), product, price, Utc::now())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub sent: u64,
    pub failed: u64,
    /// The run ended early because a stop was requested.
    pub stopped: bool,
}

/// Publish `count` random orders to `topic`, waiting `delay` after each one.
///
/// Failed publishes are logged and counted; the loop carries on. A stop request ends
/// the run before the next order (and cuts the current delay short).
pub fn run_producer<K>(
    sink: &K,
    topic: &str,
    count: u64,
    delay: Duration,
    signal: &ShutdownSignal,
) -> ProducerReport
where
    K: PublishSink + ?Sized,
{
    let factory = OrderFactory::new();
    let mut report = ProducerReport::default();

    info!(count, delay_ms = delay.as_millis() as u64, topic, "producing orders");

    for _ in 0..count {
        if signal.is_stop_requested() {
            report.stopped = true;
            break;
        }

        let order = match factory.random_order() {
            Ok(order) => order,
            Err(e) => {
                error!(error = %e, "failed to build order");
                report.failed += 1;
                continue;
            }
        };

        match sink.publish(topic, order.order_id(), &order) {
            Ok(ack) => {
                report.sent += 1;
                info!(
                    order_id = %order.order_id(),
                    product = order.product(),
                    price = %order.price(),
                    partition = ack.partition,
                    position = %ack.position,
                    "sent order"
                );
            }
            Err(e) => {
                report.failed += 1;
                error!(order_id = %order.order_id(), error = %e, "failed to send order");
            }
        }

        if !delay.is_zero() {
            signal.sleep_until_stop(delay);
        }
    }

    if signal.is_stop_requested() && report.sent + report.failed < count {
        report.stopped = true;
    }

    info!(
        sent = report.sent,
        failed = report.failed,
        stopped = report.stopped,
        "finished producing orders"
    );
    report
}
