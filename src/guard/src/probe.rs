//! Usage probe: decides whether a context entity is still referenced by records in
//! peer services.
//!
//! Each entity type maps to a fixed [`ReferenceStrategy`]. Every strategy is fail-closed:
//! a peer query that cannot be answered never yields "not referenced". Uncertainty is
//! carried as data on [`UsageResult`] rather than as an error, so callers can tell a
//! confirmed reference from an unavailable peer.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use common::config::{Configuration, GuardConfig};
use common::model::ContextEntityType;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::peer::{ListPage, PeerClient, PeerError};

const PRODUCTS_PATH: &str = "/products/";
const PRODUCT_ATTRIBUTE: &str = "product";

/// Kinds of peer records that can hold a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Asset,
    Component,
    Repair,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Asset => "asset",
            ReferenceKind::Component => "component",
            ReferenceKind::Repair => "repair",
        }
    }

    /// Noun for `count` records of this kind.
    pub fn noun(&self, count: u64) -> String {
        if count == 1 {
            self.as_str().to_string()
        } else {
            format!("{}s", self.as_str())
        }
    }

    fn list_path(&self) -> &'static str {
        match self {
            ReferenceKind::Asset => "/assets/",
            ReferenceKind::Component => "/components/",
            ReferenceKind::Repair => "/repairs/",
        }
    }

    /// Human-facing identifier field, preferred over the numeric id.
    fn display_field(&self) -> &'static str {
        match self {
            ReferenceKind::Asset => "asset_id",
            ReferenceKind::Component => "component_id",
            ReferenceKind::Repair => "repair_id",
        }
    }
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const ASSETS_AND_COMPONENTS: &[ReferenceKind] = &[ReferenceKind::Asset, ReferenceKind::Component];
const ASSETS_COMPONENTS_REPAIRS: &[ReferenceKind] = &[
    ReferenceKind::Asset,
    ReferenceKind::Component,
    ReferenceKind::Repair,
];
const ASSETS_ONLY: &[ReferenceKind] = &[ReferenceKind::Asset];

/// How references to an entity type are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceStrategy {
    /// Referencing records store the entity id themselves.
    Direct(&'static [ReferenceKind]),
    /// Referencing records store a product id; the product stores the entity id.
    TwoHop(&'static [ReferenceKind]),
    /// Ask the peer's dedicated usage endpoint first, then fall back to direct queries.
    DedicatedThenDirect(&'static [ReferenceKind]),
}

impl ReferenceStrategy {
    pub fn for_entity(entity_type: ContextEntityType) -> Self {
        match entity_type {
            ContextEntityType::Category => ReferenceStrategy::Direct(ASSETS_AND_COMPONENTS),
            ContextEntityType::Location => ReferenceStrategy::Direct(ASSETS_AND_COMPONENTS),
            ContextEntityType::Status => ReferenceStrategy::Direct(ASSETS_ONLY),
            ContextEntityType::Supplier => {
                ReferenceStrategy::DedicatedThenDirect(ASSETS_COMPONENTS_REPAIRS)
            }
            ContextEntityType::Manufacturer | ContextEntityType::Depreciation => {
                ReferenceStrategy::TwoHop(ASSETS_AND_COMPONENTS)
            }
        }
    }

    pub fn kinds(&self) -> &'static [ReferenceKind] {
        match self {
            ReferenceStrategy::Direct(kinds)
            | ReferenceStrategy::TwoHop(kinds)
            | ReferenceStrategy::DedicatedThenDirect(kinds) => kinds,
        }
    }
}

/// Outcome of a single probe.
///
/// Invariant: `verification_failed` implies `in_use`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageResult {
    pub in_use: bool,
    /// Sample identifiers per referencing kind, deduplicated, in first-seen order.
    pub referenced_by: BTreeMap<ReferenceKind, Vec<String>>,
    /// Totals per referencing kind; may exceed the number of sampled identifiers.
    pub reference_counts: BTreeMap<ReferenceKind, u64>,
    pub verification_failed: bool,
}

impl UsageResult {
    pub fn unused() -> Self {
        Self::default()
    }

    pub fn unverified() -> Self {
        Self {
            in_use: true,
            verification_failed: true,
            ..Self::default()
        }
    }

    /// Whether the entity must be kept. A result that could not be verified blocks the
    /// delete even when `in_use` was left unset.
    pub fn blocks_deletion(&self) -> bool {
        self.in_use || self.verification_failed
    }

    /// In use because a reference was actually observed.
    pub fn is_confirmed_reference(&self) -> bool {
        self.in_use && !self.verification_failed
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("usage probe misconfigured: {0}")]
    Peer(#[from] PeerError),
}

/// Seam between the coordinator and whatever answers usage questions.
#[async_trait]
pub trait UsageCheck: Send + Sync {
    async fn check_usage(
        &self,
        entity_type: ContextEntityType,
        id: i64,
    ) -> Result<UsageResult, ProbeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub sample_limit: usize,
    pub two_hop_page_size: usize,
}

impl From<&GuardConfig> for ProbeSettings {
    fn from(config: &GuardConfig) -> Self {
        Self {
            sample_limit: config.sample_limit,
            two_hop_page_size: config.two_hop_page_size,
        }
    }
}

#[derive(Debug, Default)]
struct UsageAccumulator {
    referenced_by: BTreeMap<ReferenceKind, Vec<String>>,
    counts: BTreeMap<ReferenceKind, u64>,
    confirmed: bool,
    unverified: bool,
}

impl UsageAccumulator {
    fn confirm(&mut self, kind: ReferenceKind, total: u64, identifiers: Vec<String>) {
        if total == 0 {
            return;
        }
        self.confirmed = true;
        *self.counts.entry(kind).or_default() += total;
        if !identifiers.is_empty() {
            self.referenced_by
                .entry(kind)
                .or_default()
                .extend(identifiers);
        }
    }

    /// A reference exists but its kind and holders are unknown.
    fn confirm_opaque(&mut self) {
        self.confirmed = true;
    }

    fn mark_unverified(&mut self) {
        self.unverified = true;
    }

    fn finish(self, sample_limit: usize) -> UsageResult {
        let referenced_by = self
            .referenced_by
            .into_iter()
            .map(|(kind, identifiers)| {
                let mut seen = HashSet::new();
                let unique: Vec<String> = identifiers
                    .into_iter()
                    .filter(|identifier| seen.insert(identifier.clone()))
                    .take(sample_limit)
                    .collect();
                (kind, unique)
            })
            .collect();

        UsageResult {
            in_use: self.confirmed || self.unverified,
            referenced_by,
            reference_counts: self.counts,
            verification_failed: self.unverified && !self.confirmed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefCheck {
    Matches,
    Differs,
    Unknown,
}

/// Compare a record's reference attribute with the expected id.
///
/// The attribute may be an integer, a numeric string, or an object with an `id`.
/// An explicit `null` is a non-matching value; an absent or unreadable attribute is
/// unknown.
fn check_reference(record: &Value, attribute: &str, expected: i64) -> RefCheck {
    match record.get(attribute) {
        None => RefCheck::Unknown,
        Some(Value::Null) => RefCheck::Differs,
        Some(value) => match as_id(value) {
            Some(id) if id == expected => RefCheck::Matches,
            Some(_) => RefCheck::Differs,
            None => RefCheck::Unknown,
        },
    }
}

fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => map.get("id").and_then(as_id),
        _ => None,
    }
}

fn record_id(record: &Value) -> Option<i64> {
    record.get("id").and_then(as_id)
}

fn display_identifier(record: &Value, kind: ReferenceKind) -> Option<String> {
    let display = match record.get(kind.display_field()) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    display.or_else(|| record_id(record).map(|id| id.to_string()))
}

#[derive(Clone, Debug)]
pub struct UsageProbe {
    peer: PeerClient,
    settings: ProbeSettings,
}

impl UsageProbe {
    pub fn new(peer: PeerClient, settings: ProbeSettings) -> Self {
        Self { peer, settings }
    }

    pub fn from_config(config: &Configuration) -> Result<Self, ProbeError> {
        let peer = PeerClient::new(&config.peers)?;
        Ok(Self::new(peer, ProbeSettings::from(&config.guard)))
    }

    pub fn settings(&self) -> ProbeSettings {
        self.settings
    }

    /// Answer whether `(entity_type, id)` is referenced anywhere.
    pub async fn probe(
        &self,
        entity_type: ContextEntityType,
        id: i64,
    ) -> Result<UsageResult, ProbeError> {
        let mut acc = UsageAccumulator::default();

        match ReferenceStrategy::for_entity(entity_type) {
            ReferenceStrategy::Direct(kinds) => {
                self.probe_direct(&mut acc, entity_type, id, kinds).await?;
            }
            ReferenceStrategy::TwoHop(kinds) => {
                self.probe_two_hop(&mut acc, entity_type, id, kinds).await?;
            }
            ReferenceStrategy::DedicatedThenDirect(kinds) => {
                match self.peer.check_usage(entity_type, id).await {
                    Ok(Some(false)) => {
                        log::debug!("Peer usage endpoint reports {entity_type} {id} unused");
                        return Ok(UsageResult::unused());
                    }
                    Ok(Some(true)) => acc.confirm_opaque(),
                    Ok(None) => {}
                    Err(e) if e.is_verification_failure() => {
                        log::warn!(
                            "Usage endpoint failed for {entity_type} {id}, falling back to reference queries: {e}"
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
                self.probe_direct(&mut acc, entity_type, id, kinds).await?;
            }
        }

        let result = acc.finish(self.settings.sample_limit);
        if result.verification_failed {
            log::warn!("Usage of {entity_type} {id} could not be verified; treating as in use");
        } else {
            log::debug!(
                "Probed {entity_type} {id}: in_use={} counts={:?}",
                result.in_use,
                result.reference_counts
            );
        }
        Ok(result)
    }

    async fn probe_direct(
        &self,
        acc: &mut UsageAccumulator,
        entity_type: ContextEntityType,
        id: i64,
        kinds: &[ReferenceKind],
    ) -> Result<(), ProbeError> {
        let attribute = entity_type.as_str();
        let page_size = self.settings.sample_limit;

        let pages = join_all(
            kinds
                .iter()
                .map(|kind| self.peer.list(kind.list_path(), (attribute, id), page_size)),
        )
        .await;

        for (kind, page) in kinds.iter().zip(pages) {
            match page {
                Ok(page) => record_matches(acc, *kind, attribute, id, &page, page_size, true),
                Err(e) if e.is_verification_failure() => {
                    log::warn!("Could not verify {kind} references to {entity_type} {id}: {e}");
                    acc.mark_unverified();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn probe_two_hop(
        &self,
        acc: &mut UsageAccumulator,
        entity_type: ContextEntityType,
        id: i64,
        kinds: &[ReferenceKind],
    ) -> Result<(), ProbeError> {
        let attribute = entity_type.as_str();
        let page_size = self.settings.sample_limit;

        let Some(products) = self.list_products(acc, entity_type, id).await? else {
            return Ok(());
        };

        let product_ids = self
            .validated_products(acc, attribute, id, &products)
            .await?;

        for product_id in product_ids {
            let pages = join_all(kinds.iter().map(|kind| {
                self.peer
                    .list(kind.list_path(), (PRODUCT_ATTRIBUTE, product_id), page_size)
            }))
            .await;

            for (kind, page) in kinds.iter().zip(pages) {
                match page {
                    Ok(page) => record_matches(
                        acc,
                        *kind,
                        PRODUCT_ATTRIBUTE,
                        product_id,
                        &page,
                        page_size,
                        false,
                    ),
                    Err(e) if e.is_verification_failure() => {
                        log::warn!(
                            "Could not verify {kind} references to product {product_id} ({entity_type} {id}): {e}"
                        );
                        acc.mark_unverified();
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Every product the peer lists for `entity_type=id`, page by page.
    ///
    /// Paging stops once the reported count is collected, or on a short page when the
    /// peer reports no count. A page that adds no new product, or a failure after the
    /// first page, leaves the listing incomplete and the probe unverified. `None` when
    /// not even the first page could be fetched.
    async fn list_products(
        &self,
        acc: &mut UsageAccumulator,
        entity_type: ContextEntityType,
        id: i64,
    ) -> Result<Option<Vec<Value>>, ProbeError> {
        let attribute = entity_type.as_str();
        let page_size = self.settings.two_hop_page_size.max(1);
        let mut products = Vec::new();
        let mut seen = HashSet::new();
        let mut offset = 0;

        loop {
            let page = match self
                .peer
                .list_from(PRODUCTS_PATH, (attribute, id), page_size, offset)
                .await
            {
                Ok(page) => page,
                Err(e) if e.is_verification_failure() => {
                    log::warn!(
                        "Could not list products for {entity_type} {id} at offset {offset}: {e}"
                    );
                    acc.mark_unverified();
                    return Ok((offset > 0).then_some(products));
                }
                Err(e) => return Err(e.into()),
            };

            let returned = page.results.len();
            let mut advanced = false;
            for product in page.results {
                match record_id(&product) {
                    Some(product_id) if !seen.insert(product_id) => continue,
                    Some(_) => advanced = true,
                    None => {}
                }
                products.push(product);
            }
            offset += returned;

            let exhausted = match page.count {
                Some(count) => products.len() as u64 >= count,
                None => returned < page_size,
            };
            if exhausted {
                return Ok(Some(products));
            }
            if !advanced {
                log::warn!(
                    "Product listing for {entity_type} {id} stopped advancing after {} of {} products",
                    products.len(),
                    page.count.map_or_else(|| "?".to_string(), |count| count.to_string())
                );
                acc.mark_unverified();
                return Ok(Some(products));
            }
        }
    }

    /// Products whose own attribute really equals `expected`.
    ///
    /// Peers may ignore unknown filter parameters and return unrelated products, so
    /// each product is re-checked. Products whose listing omits the attribute are
    /// looked up individually.
    async fn validated_products(
        &self,
        acc: &mut UsageAccumulator,
        attribute: &str,
        expected: i64,
        products: &[Value],
    ) -> Result<Vec<i64>, ProbeError> {
        let mut seen = HashSet::new();
        let mut product_ids = Vec::new();
        let mut foreign = 0usize;

        for product in products {
            let Some(product_id) = record_id(product) else {
                log::warn!("Product without id in listing for {attribute} {expected}");
                acc.mark_unverified();
                continue;
            };

            let check = match check_reference(product, attribute, expected) {
                RefCheck::Unknown => {
                    let path = format!("{PRODUCTS_PATH}{product_id}/");
                    match self.peer.get_detail(&path).await {
                        Ok(Some(detail)) => check_reference(&detail, attribute, expected),
                        Ok(None) => {
                            log::debug!("Product {product_id} no longer exists");
                            RefCheck::Differs
                        }
                        Err(e) if e.is_verification_failure() => {
                            log::warn!("Could not look up product {product_id}: {e}");
                            acc.mark_unverified();
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                check => check,
            };

            match check {
                RefCheck::Matches => {
                    if seen.insert(product_id) {
                        product_ids.push(product_id);
                    }
                }
                RefCheck::Differs => foreign += 1,
                RefCheck::Unknown => {
                    log::warn!(
                        "Product {product_id} does not expose `{attribute}`; cannot rule out a reference"
                    );
                    acc.mark_unverified();
                }
            }
        }

        if foreign > 0 {
            log::debug!("Dropped {foreign} products not matching {attribute} {expected}");
        }
        Ok(product_ids)
    }
}

/// Fold one listing into the accumulator.
///
/// `trust_unknown` decides what a record lacking the attribute means: with a filter the
/// peer honoured it can be counted as a match, otherwise it is ambiguous.
fn record_matches(
    acc: &mut UsageAccumulator,
    kind: ReferenceKind,
    attribute: &str,
    expected: i64,
    page: &ListPage,
    page_size: usize,
    trust_unknown: bool,
) {
    let mut matched = Vec::new();
    let mut matched_count = 0u64;
    let mut unknown = Vec::new();
    let mut unknown_count = 0u64;
    let mut foreign = 0usize;

    for record in &page.results {
        let identifier = display_identifier(record, kind);
        match check_reference(record, attribute, expected) {
            RefCheck::Matches => {
                matched_count += 1;
                matched.extend(identifier);
            }
            RefCheck::Differs => foreign += 1,
            RefCheck::Unknown => {
                unknown_count += 1;
                unknown.extend(identifier);
            }
        }
    }

    if foreign == 0 {
        if unknown_count == 0 || trust_unknown {
            // A count that disagrees with the returned records is not trusted downwards
            let total = page.total().max(matched_count + unknown_count);
            matched.extend(unknown);
            acc.confirm(kind, total, matched);
        } else {
            acc.mark_unverified();
            acc.confirm(kind, matched_count, matched);
        }
        return;
    }

    // The peer ignored the filter: only validated records count, and whatever it did
    // not return cannot be ruled out.
    log::warn!(
        "Peer ignored the `{attribute}` filter on {kind} listing ({foreign} unrelated records)"
    );
    if unknown_count > 0 || page.is_truncated(page_size) {
        acc.mark_unverified();
    }
    acc.confirm(kind, matched_count, matched);
}

#[async_trait]
impl UsageCheck for UsageProbe {
    async fn check_usage(
        &self,
        entity_type: ContextEntityType,
        id: i64,
    ) -> Result<UsageResult, ProbeError> {
        self.probe(entity_type, id).await
    }
}
