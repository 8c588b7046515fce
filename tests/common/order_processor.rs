// order_processor.rs
use std::sync::Arc;

use anyhow::{Context, bail};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stream_broker::codec::Record;
use stream_broker::processor::{
    ErrorHandling, ProcessingContext, ProcessingResultBuilder, RecordProcessor, TypedRecord,
};
use stream_broker::storage::state::{ColumnFamily, FIRST_CUSTOM_COLUMN_FAMILY, TypedColumnFamily};
use stream_broker::{ProcessingError, UNKEYED};

pub const ORDER: u16 = 1;

pub mod intent {
    pub const CREATE: u8 = 0;
    pub const CREATED: u8 = 1;
    pub const COMPLETE: u8 = 2;
    pub const COMPLETED: u8 = 3;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub name: String,
    pub amount: u64,
    #[serde(default)]
    pub auto_complete: bool,
    #[serde(default)]
    pub completed: bool,
}

impl Order {
    pub fn new(name: &str, amount: u64) -> Self {
        Self {
            name: name.to_string(),
            amount,
            auto_complete: false,
            completed: false,
        }
    }

    pub fn auto_complete(mut self) -> Self {
        self.auto_complete = true;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(data).context("invalid order value")
    }
}

pub fn create_order(order: &Order) -> Record {
    Record::command(UNKEYED, ORDER, intent::CREATE, order.encode()).unwrap()
}

/// Value of COMPLETE commands; records may not have an empty value.
pub const COMPLETION: &[u8] = b"complete";

pub fn complete_order(key: i64) -> Record {
    Record::command(key, ORDER, intent::COMPLETE, COMPLETION).unwrap()
}

/// Observations shared between a test and the processor it installed.
#[derive(Default)]
pub struct Probe {
    /// Keys recorded by post-commit tasks
    pub side_effects: Mutex<Vec<i64>>,
    /// Orders with this name fail to process
    pub fail_on: Mutex<Option<String>>,
    pub processed: Mutex<Vec<(u8, i64)>>,
    pub replayed: Mutex<Vec<(u8, i64)>>,
}

impl Probe {
    pub fn fail_on(&self, name: Option<&str>) {
        *self.fail_on.lock() = name.map(String::from);
    }

    pub fn side_effects(&self) -> Vec<i64> {
        self.side_effects.lock().clone()
    }
}

pub fn orders() -> TypedColumnFamily<i64, Order> {
    TypedColumnFamily::new(ColumnFamily::Custom(FIRST_CUSTOM_COLUMN_FAMILY))
}

pub fn orders_by_name() -> TypedColumnFamily<(String, i64), ()> {
    TypedColumnFamily::new(ColumnFamily::Custom(FIRST_CUSTOM_COLUMN_FAMILY + 1))
}

pub struct OrderProcessor {
    probe: Arc<Probe>,
    orders: TypedColumnFamily<i64, Order>,
    by_name: TypedColumnFamily<(String, i64), ()>,
}

impl OrderProcessor {
    pub fn new(probe: Arc<Probe>) -> Self {
        Self {
            probe,
            orders: orders(),
            by_name: orders_by_name(),
        }
    }

    fn create(
        &mut self,
        record: &TypedRecord,
        ctx: &mut ProcessingContext<'_>,
        result: &mut ProcessingResultBuilder,
    ) -> anyhow::Result<()> {
        let order = Order::decode(&record.value)?;
        if self.probe.fail_on.lock().as_deref() == Some(order.name.as_str()) {
            bail!("cannot create order {}", order.name);
        }

        let key = if record.key == UNKEYED {
            ctx.next_key()?
        } else {
            record.key
        };
        result.append_event(key, ORDER, intent::CREATED, order.encode());
        if order.auto_complete {
            result.append_command(key, ORDER, intent::COMPLETE, COMPLETION);
        }

        let probe = self.probe.clone();
        result.append_post_commit_task(move || {
            probe.side_effects.lock().push(key);
            Ok(())
        });
        Ok(())
    }

    fn complete(
        &mut self,
        record: &TypedRecord,
        ctx: &mut ProcessingContext<'_>,
        result: &mut ProcessingResultBuilder,
    ) -> anyhow::Result<()> {
        let Some(mut order) = self.orders.get(ctx.transaction(), &record.key)? else {
            bail!("order {} not found", record.key);
        };
        order.completed = true;
        result.append_event(record.key, ORDER, intent::COMPLETED, order.encode());
        Ok(())
    }
}

impl RecordProcessor for OrderProcessor {
    fn accepts(&self, value_type: u16) -> bool {
        value_type == ORDER
    }

    fn process(
        &mut self,
        record: &TypedRecord,
        ctx: &mut ProcessingContext<'_>,
        result: &mut ProcessingResultBuilder,
    ) -> anyhow::Result<()> {
        self.probe.processed.lock().push((record.intent(), record.key));
        match record.intent() {
            intent::CREATE => self.create(record, ctx, result),
            intent::COMPLETE => self.complete(record, ctx, result),
            other => bail!("unexpected command intent {}", other),
        }
    }

    fn replay(
        &mut self,
        record: &TypedRecord,
        ctx: &mut ProcessingContext<'_>,
    ) -> anyhow::Result<()> {
        self.probe.replayed.lock().push((record.intent(), record.key));
        let order = Order::decode(&record.value)?;
        match record.intent() {
            intent::CREATED => {
                self.orders.insert(ctx.transaction_mut(), &record.key, &order)?;
                self.by_name
                    .insert(ctx.transaction_mut(), &(order.name.clone(), record.key), &())?;
            }
            intent::COMPLETED => {
                self.orders.update(ctx.transaction_mut(), &record.key, &order)?;
            }
            other => bail!("unexpected event intent {}", other),
        }
        Ok(())
    }

    fn on_processing_error(
        &mut self,
        error: &ProcessingError,
        record: &TypedRecord,
        _ctx: &mut ProcessingContext<'_>,
        result: &mut ProcessingResultBuilder,
    ) -> ErrorHandling {
        if record.intent() == intent::COMPLETE && error.to_string().contains("not found") {
            result.append_rejection(
                record.key,
                ORDER,
                record.intent(),
                error.to_string(),
                record.value.clone(),
            );
            return ErrorHandling::Handled;
        }
        ErrorHandling::Unhandled
    }
}
