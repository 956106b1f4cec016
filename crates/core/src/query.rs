//! Read-side shapes consumed by listing screens and dashboards.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::approval::{
    normalize_role, ApprovalRequest, EntityType, LevelStatus, Priority, RequestStatus,
};

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 200;
pub const TOP_APPROVERS: usize = 5;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalFilter {
    pub status: Option<RequestStatus>,
    pub entity_type: Option<EntityType>,
    pub priority: Option<Priority>,
    pub requested_from: Option<DateTime<Utc>>,
    pub requested_to: Option<DateTime<Utc>>,
}

impl ApprovalFilter {
    pub fn matches(&self, request: &ApprovalRequest) -> bool {
        self.status.map_or(true, |status| request.status == status)
            && self.entity_type.map_or(true, |kind| request.entity_type == kind)
            && self.priority.map_or(true, |priority| request.priority == priority)
            && self.requested_from.map_or(true, |from| request.requested_at >= from)
            && self.requested_to.map_or(true, |to| request.requested_at <= to)
    }
}

/// One-based page selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: DEFAULT_PAGE_LIMIT }
    }
}

impl PageRequest {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page: page.max(1), limit: limit.clamp(1, MAX_PAGE_LIMIT) }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, request: PageRequest) -> Self {
        let limit = u64::from(request.limit.max(1));
        let pages = total.div_ceil(limit) as u32;
        Self { items, total, page: request.page, limit: request.limit, pages }
    }

    /// Slices an already ordered, fully materialized result set.
    pub fn from_sorted(all: Vec<T>, request: PageRequest) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(request.offset() as usize)
            .take(request.limit as usize)
            .collect();
        Self::new(items, total, request)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverTally {
    pub approver_id: String,
    pub decisions: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStats {
    pub by_status: BTreeMap<String, u64>,
    pub by_entity_type: BTreeMap<String, u64>,
    pub by_priority: BTreeMap<String, u64>,
    pub pending_first_level: u64,
    pub under_review: u64,
    pub approved_today: u64,
    pub total_pending_amount: Decimal,
    pub avg_hours_to_approval: Option<f64>,
    pub top_approvers: Vec<ApproverTally>,
}

/// Most urgent first, newest first within a priority.
pub fn sort_for_inbox(requests: &mut [ApprovalRequest]) {
    requests.sort_by_key(|request| {
        (request.priority.urgency_rank(), Reverse(request.requested_at))
    });
}

pub fn sort_newest_first(requests: &mut [ApprovalRequest]) {
    requests.sort_by_key(|request| Reverse(request.requested_at));
}

pub fn sort_recently_completed(requests: &mut [ApprovalRequest]) {
    requests.sort_by_key(|request| Reverse(request.completed_at));
}

pub fn awaits_role(request: &ApprovalRequest, role: &str) -> bool {
    let role = normalize_role(role);
    request.status == RequestStatus::Pending
        && request
            .active_level()
            .is_some_and(|level| normalize_role(&level.approver_role) == role)
}

pub fn matches_search(request: &ApprovalRequest, query: &str) -> bool {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return false;
    }
    request.id.0.to_lowercase().contains(&needle) || request.title.to_lowercase().contains(&needle)
}

pub fn compute_stats<'a>(
    requests: impl IntoIterator<Item = &'a ApprovalRequest>,
    now: DateTime<Utc>,
) -> ApprovalStats {
    let start_of_day = start_of_day(now);
    let mut stats = ApprovalStats::default();
    let mut approval_hours = Vec::new();
    let mut tallies: HashMap<String, u64> = HashMap::new();

    for request in requests {
        *stats.by_status.entry(request.status.as_str().to_owned()).or_default() += 1;
        *stats.by_entity_type.entry(request.entity_type.as_str().to_owned()).or_default() += 1;
        *stats.by_priority.entry(request.priority.as_str().to_owned()).or_default() += 1;

        match request.status {
            RequestStatus::Pending => {
                stats.total_pending_amount += request.amount;
                if request.current_level == 1 {
                    stats.pending_first_level += 1;
                } else {
                    stats.under_review += 1;
                }
            }
            RequestStatus::Approved => {
                if let Some(completed_at) = request.completed_at {
                    if completed_at >= start_of_day {
                        stats.approved_today += 1;
                    }
                    let seconds = (completed_at - request.requested_at).num_seconds();
                    approval_hours.push(seconds as f64 / 3600.0);
                }
            }
            RequestStatus::Rejected | RequestStatus::Cancelled => {}
        }

        for level in &request.levels {
            if matches!(level.status, LevelStatus::Approved | LevelStatus::Rejected) {
                if let Some(approver) = &level.approved_by {
                    *tallies.entry(approver.clone()).or_default() += 1;
                }
            }
        }
    }

    if !approval_hours.is_empty() {
        stats.avg_hours_to_approval =
            Some(approval_hours.iter().sum::<f64>() / approval_hours.len() as f64);
    }
    stats.top_approvers = rank_approvers(tallies);
    stats
}

pub fn rank_approvers(tallies: HashMap<String, u64>) -> Vec<ApproverTally> {
    let mut ranked: Vec<ApproverTally> = tallies
        .into_iter()
        .map(|(approver_id, decisions)| ApproverTally { approver_id, decisions })
        .collect();
    ranked.sort_by(|a, b| {
        b.decisions.cmp(&a.decisions).then_with(|| a.approver_id.cmp(&b.approver_id))
    });
    ranked.truncate(TOP_APPROVERS);
    ranked
}

pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_hms_opt(0, 0, 0).map(|midnight| midnight.and_utc()).unwrap_or(now)
}
