use std::fmt;
use std::sync::Arc;

use futures::future;
use futures::stream::{self, StreamExt};
use serde::Deserialize;

use pulse_core::{ConfigError, Packet, Payload};
use pulse_hub::PacketFilter;

use super::{stage_error, Operator, OperatorSpec, StageItem, StageStream};
use crate::registry::{Mapper, Predicate};

// ── filter ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FilterParams {
    /// Name of a registered predicate.
    predicate: Option<String>,
    #[serde(flatten)]
    fields: PacketFilter,
}

/// Drops packets that fail the field filter or the named predicate. With
/// neither configured every packet passes.
pub struct FilterOp {
    name: String,
    fields: PacketFilter,
    predicate: Option<(String, Predicate)>,
}

impl FilterOp {
    pub fn new(fields: PacketFilter) -> Self {
        Self {
            name: "filter".into(),
            fields,
            predicate: None,
        }
    }

    pub fn with_predicate(mut self, name: impl Into<String>, predicate: Predicate) -> Self {
        self.predicate = Some((name.into(), predicate));
        self
    }

    pub fn from_spec(spec: &OperatorSpec<'_>) -> Result<Arc<dyn Operator>, ConfigError> {
        let params: FilterParams = spec.params_or_default()?;
        let mut op = FilterOp::new(params.fields);
        op.name = spec.name.to_string();
        if let Some(name) = params.predicate {
            let predicate = spec
                .registry
                .predicate(&name)
                .ok_or_else(|| spec.malformed(format!("unknown predicate '{name}'")))?;
            op = op.with_predicate(name, predicate);
        }
        Ok(Arc::new(op))
    }
}

impl fmt::Debug for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterOp")
            .field("fields", &self.fields)
            .field("predicate", &self.predicate.as_ref().map(|(name, _)| name))
            .finish()
    }
}

impl Operator for FilterOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, input: StageStream) -> StageStream {
        let fields = self.fields.clone();
        let predicate = self.predicate.as_ref().map(|(_, p)| p.clone());
        input
            .filter(move |item| {
                let keep = match item {
                    Ok(packet) => {
                        fields.matches(packet) && predicate.as_ref().map_or(true, |p| p(packet))
                    }
                    Err(_) => true,
                };
                future::ready(keep)
            })
            .boxed()
    }
}

// ── map ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MapParams {
    /// Name of a registered mapper, applied first.
    mapper: Option<String>,
    scale: Option<f64>,
    offset: Option<f64>,
}

/// Transforms each packet: the named mapper first, then `value * scale +
/// offset` on numeric payloads. Non-numeric payloads skip the affine step.
pub struct MapOp {
    name: String,
    mapper: Option<(String, Mapper)>,
    scale: f64,
    offset: f64,
}

impl MapOp {
    pub fn affine(scale: f64, offset: f64) -> Self {
        Self {
            name: "map".into(),
            mapper: None,
            scale,
            offset,
        }
    }

    pub fn with_mapper(mut self, name: impl Into<String>, mapper: Mapper) -> Self {
        self.mapper = Some((name.into(), mapper));
        self
    }

    pub fn from_spec(spec: &OperatorSpec<'_>) -> Result<Arc<dyn Operator>, ConfigError> {
        let params: MapParams = spec.params_or_default()?;
        let mut op = MapOp::affine(params.scale.unwrap_or(1.0), params.offset.unwrap_or(0.0));
        op.name = format!("{}#{}", spec.name, spec.index);
        if let Some(name) = params.mapper {
            let mapper = spec
                .registry
                .mapper(&name)
                .ok_or_else(|| spec.malformed(format!("unknown mapper '{name}'")))?;
            op = op.with_mapper(name, mapper);
        }
        Ok(Arc::new(op))
    }

    fn is_identity(&self) -> bool {
        self.mapper.is_none() && self.scale == 1.0 && self.offset == 0.0
    }
}

impl fmt::Debug for MapOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapOp")
            .field("mapper", &self.mapper.as_ref().map(|(name, _)| name))
            .field("scale", &self.scale)
            .field("offset", &self.offset)
            .finish()
    }
}

impl Operator for MapOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, input: StageStream) -> StageStream {
        if self.is_identity() {
            return input;
        }
        let stage = self.name.clone();
        let mapper = self.mapper.as_ref().map(|(_, m)| m.clone());
        let (scale, offset) = (self.scale, self.offset);
        input
            .map(move |item: StageItem| -> StageItem {
                let mut packet = item?;
                if let Some(mapper) = &mapper {
                    packet = mapper(packet).map_err(|e| stage_error(&stage, format!("{e:#}")))?;
                }
                if scale != 1.0 || offset != 0.0 {
                    if let Some(value) = packet.value() {
                        packet = packet.with_payload(Payload::Number(value * scale + offset));
                    }
                }
                Ok(packet)
            })
            .boxed()
    }
}

// ── distinct ────────────────────────────────────────────────────────

/// Drops a packet whose content equals the packet emitted just before it.
/// Content is everything but the id and timestamp.
#[derive(Debug, Default)]
pub struct DistinctOp;

impl DistinctOp {
    pub fn from_spec(_spec: &OperatorSpec<'_>) -> Result<Arc<dyn Operator>, ConfigError> {
        Ok(Arc::new(DistinctOp))
    }
}

fn same_content(a: &Packet, b: &Packet) -> bool {
    a.stream_type == b.stream_type
        && a.payload == b.payload
        && a.source == b.source
        && a.metadata == b.metadata
}

impl Operator for DistinctOp {
    fn name(&self) -> &str {
        "distinct"
    }

    fn apply(&self, input: StageStream) -> StageStream {
        let mut last: Option<Packet> = None;
        input
            .filter(move |item| {
                let keep = match item {
                    Ok(packet) => {
                        let repeated = last.as_ref().is_some_and(|prev| same_content(prev, packet));
                        if !repeated {
                            last = Some(packet.clone());
                        }
                        !repeated
                    }
                    Err(_) => true,
                };
                future::ready(keep)
            })
            .boxed()
    }
}

// ── take / skip ─────────────────────────────────────────────────────

/// Passes the first `count` packets, then ends the stream. Error items pass
/// through without counting.
#[derive(Debug)]
pub struct TakeOp {
    count: usize,
}

impl TakeOp {
    pub fn new(count: usize) -> Self {
        Self { count }
    }

    pub fn from_spec(spec: &OperatorSpec<'_>) -> Result<Arc<dyn Operator>, ConfigError> {
        Ok(Arc::new(TakeOp::new(spec.count()?)))
    }
}

impl Operator for TakeOp {
    fn name(&self) -> &str {
        "take"
    }

    fn apply(&self, input: StageStream) -> StageStream {
        let count = self.count;
        stream::unfold((input, 0usize), move |(mut input, taken)| async move {
            if taken >= count {
                return None;
            }
            let item = input.next().await?;
            let taken = taken + usize::from(item.is_ok());
            Some((item, (input, taken)))
        })
        .boxed()
    }
}

/// Drops the first `count` packets. Error items pass through without
/// counting.
#[derive(Debug)]
pub struct SkipOp {
    count: usize,
}

impl SkipOp {
    pub fn new(count: usize) -> Self {
        Self { count }
    }

    pub fn from_spec(spec: &OperatorSpec<'_>) -> Result<Arc<dyn Operator>, ConfigError> {
        Ok(Arc::new(SkipOp::new(spec.count()?)))
    }
}

impl Operator for SkipOp {
    fn name(&self) -> &str {
        "skip"
    }

    fn apply(&self, input: StageStream) -> StageStream {
        let mut remaining = self.count;
        input
            .filter(move |item| {
                let keep = match item {
                    Ok(_) if remaining > 0 => {
                        remaining -= 1;
                        false
                    }
                    _ => true,
                };
                future::ready(keep)
            })
            .boxed()
    }
}

// ── passthrough ─────────────────────────────────────────────────────

/// Stands in for operator names nothing is registered under.
#[derive(Debug)]
pub struct PassthroughOp {
    name: String,
}

impl PassthroughOp {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

impl Operator for PassthroughOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, input: StageStream) -> StageStream {
        input
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::tests::{numbers, values};
    use chrono::Utc;
    use pulse_core::{meta, PipelineError, StreamType};

    #[tokio::test]
    async fn filter_by_predicate_and_fields() {
        let positive: Predicate = Arc::new(|p: &Packet| p.value().is_some_and(|v| v > 0.0));
        let op =
            FilterOp::new(PacketFilter::default().max(2.5)).with_predicate("positive", positive);
        let out = values(op.apply(numbers(&[1.0, -1.0, 2.0, 3.0, 0.0]))).await;
        assert_eq!(out, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn filter_without_params_passes_everything() {
        let op = FilterOp::new(PacketFilter::default());
        assert_eq!(values(op.apply(numbers(&[1.0, -2.0]))).await, vec![1.0, -2.0]);
    }

    #[tokio::test]
    async fn map_applies_mapper_then_affine() {
        let double: Mapper = Arc::new(|p: Packet| {
            let v = p.value().ok_or_else(|| anyhow::anyhow!("not numeric"))?;
            Ok(p.with_payload(v * 2.0))
        });
        let op = MapOp::affine(1.0, 1.0).with_mapper("double", double);
        let out = values(op.apply(numbers(&[1.0, 5.0]))).await;
        assert_eq!(out, vec![3.0, 11.0]);
    }

    #[tokio::test]
    async fn failing_mapper_yields_error_item_and_continues() {
        let numeric_only: Mapper = Arc::new(|p: Packet| {
            anyhow::ensure!(p.value().is_some(), "payload is not numeric");
            Ok(p)
        });
        let op = MapOp::affine(1.0, 0.0).with_mapper("numeric_only", numeric_only);
        let input: Vec<StageItem> = vec![
            Ok(Packet::new(StreamType::SensorMetrics, 1.0, Utc::now())),
            Ok(Packet::new(StreamType::SensorMetrics, "oops", Utc::now())),
            Ok(Packet::new(StreamType::SensorMetrics, 2.0, Utc::now())),
        ];
        let out: Vec<StageItem> = op.apply(stream::iter(input).boxed()).collect().await;
        assert_eq!(out.len(), 3);
        assert!(out[0].is_ok());
        assert!(matches!(
            &out[1],
            Err(PipelineError::Stage { stage, message })
                if stage == "map" && message.contains("not numeric")
        ));
        assert_eq!(out[2].as_ref().unwrap().value(), Some(2.0));
    }

    #[tokio::test]
    async fn map_leaves_text_alone() {
        let op = MapOp::affine(10.0, 0.0);
        let input: Vec<StageItem> =
            vec![Ok(Packet::new(StreamType::SystemStatus, "ok", Utc::now()))];
        let out: Vec<StageItem> = op.apply(stream::iter(input).boxed()).collect().await;
        assert_eq!(out[0].as_ref().unwrap().payload, Payload::Text("ok".into()));
    }

    #[tokio::test]
    async fn distinct_only_suppresses_consecutive_repeats() {
        let out = values(DistinctOp.apply(numbers(&[1.0, 1.0, 2.0, 1.0, 1.0, 3.0, 3.0]))).await;
        assert_eq!(out, vec![1.0, 2.0, 1.0, 3.0]);
    }

    #[tokio::test]
    async fn distinct_compares_metadata() {
        let now = Utc::now();
        let input: Vec<StageItem> = vec![
            Ok(Packet::new(StreamType::SensorMetrics, 1.0, now).with_meta(meta::ROOM_ID, "a")),
            Ok(Packet::new(StreamType::SensorMetrics, 1.0, now).with_meta(meta::ROOM_ID, "b")),
        ];
        let out = values(DistinctOp.apply(stream::iter(input).boxed())).await;
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn take_emits_min_of_n_and_length() {
        assert_eq!(values(TakeOp::new(2).apply(numbers(&[1.0, 2.0, 3.0]))).await, vec![1.0, 2.0]);
        assert_eq!(values(TakeOp::new(5).apply(numbers(&[1.0, 2.0]))).await, vec![1.0, 2.0]);
        assert!(values(TakeOp::new(0).apply(numbers(&[1.0]))).await.is_empty());
    }

    #[tokio::test]
    async fn take_completes_without_waiting_for_source() {
        let endless =
            stream::repeat_with(|| Ok(Packet::new(StreamType::SensorMetrics, 1.0, Utc::now())));
        let out = values(TakeOp::new(3).apply(endless.boxed())).await;
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn skip_emits_suffix() {
        let out = values(SkipOp::new(2).apply(numbers(&[1.0, 2.0, 3.0, 4.0]))).await;
        assert_eq!(out, vec![3.0, 4.0]);
        assert!(values(SkipOp::new(9).apply(numbers(&[1.0]))).await.is_empty());
    }

    #[tokio::test]
    async fn error_items_do_not_count_for_take() {
        let input: Vec<StageItem> = vec![
            Err(stage_error("map", "boom")),
            Ok(Packet::new(StreamType::SensorMetrics, 1.0, Utc::now())),
            Ok(Packet::new(StreamType::SensorMetrics, 2.0, Utc::now())),
        ];
        let out: Vec<StageItem> = TakeOp::new(1).apply(stream::iter(input).boxed()).collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[0].is_err());
    }
}
