//! Workflow composer: chain, group and chord compositions
//!
//! A [`Composition`] is a tree whose leaves are task requests. Submitting it
//! flattens the tree into a [`WorkflowState`], an arena of nodes that the
//! engine advances one task completion at a time. Every transition is a pure
//! function of the state that returns [`WorkflowAction`]s for the engine to
//! carry out (enqueue a task, cancel a task, announce completion). Because the
//! engine applies each transition inside one atomic record update, "members
//! remaining" counters are decremented exactly once per member and a chord's
//! callback is started by exactly one completion.
//!
//! Data flow:
//! - a chain step receives the previous step's result as its first positional argument
//! - a group or chord nested in a chain passes that value to every header member
//! - a chord callback receives the ordered list of member results, with a
//!   failure marker `{"task_id", "status", "error"}` in place of each failed member

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result, TaskError};
use crate::progress::percent;
use crate::task::TaskRequest;
use crate::types::{IdAllocator, TaskId, TaskStatus, WorkflowId, WorkflowStatus};

/// What a group does when one member fails terminally
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupFailurePolicy {
    /// Let the other members finish
    #[default]
    Continue,
    /// Hard-cancel members that are still running
    CancelSiblings,
}

/// A workflow definition
#[derive(Clone, Debug, PartialEq)]
pub enum Composition {
    /// A single task
    Task(TaskRequest),
    /// Run in order, feeding each result to the next step
    Chain(Vec<Composition>),
    /// Run in parallel
    Group {
        /// Members, started together
        members: Vec<Composition>,
        /// Failure handling
        on_failure: GroupFailurePolicy,
    },
    /// Run the header in parallel, then the callback with all header results
    Chord {
        /// Members, started together
        header: Vec<Composition>,
        /// Task started once every header member is terminal
        callback: TaskRequest,
    },
}

impl Composition {
    /// Single task
    pub fn task(request: TaskRequest) -> Self {
        Composition::Task(request)
    }

    /// Sequential composition
    pub fn chain(steps: impl IntoIterator<Item = Composition>) -> Self {
        Composition::Chain(steps.into_iter().collect())
    }

    /// Parallel composition that lets siblings finish when one fails
    pub fn group(members: impl IntoIterator<Item = Composition>) -> Self {
        Self::group_with_policy(members, GroupFailurePolicy::Continue)
    }

    /// Parallel composition with an explicit failure policy
    pub fn group_with_policy(
        members: impl IntoIterator<Item = Composition>,
        on_failure: GroupFailurePolicy,
    ) -> Self {
        Composition::Group {
            members: members.into_iter().collect(),
            on_failure,
        }
    }

    /// Parallel composition followed by a callback
    pub fn chord(header: impl IntoIterator<Item = Composition>, callback: TaskRequest) -> Self {
        Composition::Chord {
            header: header.into_iter().collect(),
            callback,
        }
    }

    /// Reject empty chains, groups and chord headers
    pub fn validate(&self) -> Result<()> {
        let (name, children) = match self {
            Composition::Task(_) => return Ok(()),
            Composition::Chain(steps) => ("chain", steps),
            Composition::Group { members, .. } => ("group", members),
            Composition::Chord { header, .. } => ("chord header", header),
        };
        if children.is_empty() {
            return Err(Error::InvalidRequest(format!("{} must not be empty", name)));
        }
        children.iter().try_for_each(Composition::validate)
    }

    /// Every task request in the tree, callbacks included
    pub fn requests(&self) -> Vec<&TaskRequest> {
        let mut out = Vec::new();
        self.collect_requests(&mut out);
        out
    }

    fn collect_requests<'a>(&'a self, out: &mut Vec<&'a TaskRequest>) {
        match self {
            Composition::Task(request) => out.push(request),
            Composition::Chain(children) | Composition::Group { members: children, .. } => {
                children.iter().for_each(|c| c.collect_requests(out));
            }
            Composition::Chord { header, callback } => {
                header.iter().for_each(|c| c.collect_requests(out));
                out.push(callback);
            }
        }
    }
}

impl From<TaskRequest> for Composition {
    fn from(request: TaskRequest) -> Self {
        Composition::Task(request)
    }
}

/// Side effect requested by a workflow transition
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum WorkflowAction {
    /// Create and enqueue the task for a leaf node
    Enqueue {
        node: usize,
        task_id: TaskId,
        request: TaskRequest,
    },
    /// Hard-cancel a running member
    Cancel(TaskId),
    /// The workflow reached a terminal status
    Finished(WorkflowStatus),
}

#[derive(Clone, Debug)]
enum NodeKind {
    Task {
        request: TaskRequest,
        task_id: Option<TaskId>,
    },
    Chain {
        steps: Vec<usize>,
        current: usize,
    },
    Group {
        members: Vec<usize>,
        remaining: usize,
        on_failure: GroupFailurePolicy,
    },
    Chord {
        header: Vec<usize>,
        remaining: usize,
        callback: usize,
    },
}

#[derive(Clone, Debug)]
struct Node {
    parent: Option<usize>,
    kind: NodeKind,
    status: WorkflowStatus,
    result: Option<Value>,
    error: Option<TaskError>,
}

// what to do after a child reports in; computed while the parent is borrowed
enum Plan {
    Wait,
    Start(usize, Option<Value>),
    Finish(WorkflowStatus, Option<Value>, Option<TaskError>),
    HaltChain(Vec<usize>, WorkflowStatus, Option<TaskError>),
    FinishGroup(Vec<usize>),
    CancelSiblings(Vec<usize>),
    StartCallback(Vec<usize>, usize),
    FinishChord(Vec<usize>, usize),
}

/// Runtime state of a submitted workflow
#[derive(Clone, Debug)]
pub struct WorkflowState {
    /// Workflow ID
    pub id: WorkflowId,
    /// Aggregate status
    pub status: WorkflowStatus,
    /// When the workflow was submitted
    pub created_at: DateTime<Utc>,
    /// When the workflow reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    nodes: Vec<Node>,
}

impl WorkflowState {
    /// Flatten a composition; node 0 is the root
    pub fn new(id: WorkflowId, composition: Composition) -> Self {
        let mut nodes = Vec::new();
        add_node(&mut nodes, composition, None);
        Self {
            id,
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
            nodes,
        }
    }

    /// Start the root node
    pub(crate) fn start(&mut self, ids: &IdAllocator) -> Vec<WorkflowAction> {
        let mut actions = Vec::new();
        if self.status == WorkflowStatus::Pending && !self.nodes.is_empty() {
            self.status = WorkflowStatus::Running;
            self.start_node(0, None, ids, &mut actions);
        }
        actions
    }

    /// Record a member task's terminal outcome
    ///
    /// Stale or duplicate reports (wrong task id, node already terminal) are ignored.
    pub(crate) fn complete_task(
        &mut self,
        node: usize,
        task_id: TaskId,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<TaskError>,
        ids: &IdAllocator,
    ) -> Vec<WorkflowAction> {
        let mut actions = Vec::new();
        let Some(n) = self.nodes.get(node) else {
            return actions;
        };
        let matches = matches!(n.kind, NodeKind::Task { task_id: Some(id), .. } if id == task_id);
        if !matches || n.status.is_terminal() || !status.is_terminal() {
            return actions;
        }
        self.finish_node(node, WorkflowStatus::from(status), result, error, ids, &mut actions);
        actions
    }

    /// Cancel everything that has not finished
    ///
    /// Nodes that never started are marked Cancelled; running members get a
    /// Cancel action and report back through [`Self::complete_task`].
    pub(crate) fn cancel(&mut self) -> Vec<WorkflowAction> {
        let mut actions = Vec::new();
        if !self.status.is_terminal() && !self.nodes.is_empty() {
            self.cancel_subtree(0, &mut actions);
        }
        actions
    }

    fn start_node(
        &mut self,
        idx: usize,
        upstream: Option<Value>,
        ids: &IdAllocator,
        actions: &mut Vec<WorkflowAction>,
    ) {
        // cancelled before it was reached
        if self.nodes[idx].status.is_terminal() {
            let status = self.nodes[idx].status;
            self.finish_node(idx, status, None, None, ids, actions);
            return;
        }
        self.nodes[idx].status = WorkflowStatus::Running;

        let children = match &mut self.nodes[idx].kind {
            NodeKind::Task { request, task_id } => {
                let id = ids.next_task();
                *task_id = Some(id);
                let mut request = request.clone();
                if let Some(value) = upstream {
                    request.input.prepend(value);
                }
                actions.push(WorkflowAction::Enqueue {
                    node: idx,
                    task_id: id,
                    request,
                });
                return;
            }
            NodeKind::Chain { steps, current } => {
                *current = 0;
                steps.first().copied().into_iter().collect::<Vec<_>>()
            }
            NodeKind::Group { members, .. } => members.clone(),
            NodeKind::Chord { header, .. } => header.clone(),
        };

        if children.is_empty() {
            self.finish_node(idx, WorkflowStatus::Succeeded, Some(json!([])), None, ids, actions);
            return;
        }
        for child in children {
            self.start_node(child, upstream.clone(), ids, actions);
        }
    }

    fn finish_node(
        &mut self,
        idx: usize,
        status: WorkflowStatus,
        result: Option<Value>,
        error: Option<TaskError>,
        ids: &IdAllocator,
        actions: &mut Vec<WorkflowAction>,
    ) {
        let node = &mut self.nodes[idx];
        node.status = status;
        node.result = if status == WorkflowStatus::Succeeded {
            result
        } else {
            None
        };
        node.error = error;

        let parent = node.parent;
        match parent {
            Some(parent) => self.child_finished(parent, idx, ids, actions),
            None => {
                self.status = status;
                self.finished_at = Some(Utc::now());
                actions.push(WorkflowAction::Finished(status));
            }
        }
    }

    fn child_finished(
        &mut self,
        parent: usize,
        child: usize,
        ids: &IdAllocator,
        actions: &mut Vec<WorkflowAction>,
    ) {
        if self.nodes[parent].status.is_terminal() {
            return;
        }
        let (child_status, child_result, child_error) = {
            let c = &self.nodes[child];
            (c.status, c.result.clone(), c.error.clone())
        };

        let plan = match &mut self.nodes[parent].kind {
            NodeKind::Task { .. } => Plan::Wait,
            NodeKind::Chain { steps, current } => {
                if child_status == WorkflowStatus::Succeeded {
                    *current += 1;
                    match steps.get(*current) {
                        Some(&next) => Plan::Start(next, child_result),
                        None => Plan::Finish(WorkflowStatus::Succeeded, child_result, None),
                    }
                } else {
                    let skipped = steps.get(*current + 1..).unwrap_or_default().to_vec();
                    Plan::HaltChain(skipped, child_status, child_error)
                }
            }
            NodeKind::Group {
                members,
                remaining,
                on_failure,
            } => {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    Plan::FinishGroup(members.clone())
                } else if child_status == WorkflowStatus::Failed
                    && *on_failure == GroupFailurePolicy::CancelSiblings
                {
                    Plan::CancelSiblings(members.iter().copied().filter(|&m| m != child).collect())
                } else {
                    Plan::Wait
                }
            }
            NodeKind::Chord {
                header,
                remaining,
                callback,
            } => {
                if child == *callback {
                    Plan::FinishChord(header.clone(), *callback)
                } else {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        Plan::StartCallback(header.clone(), *callback)
                    } else {
                        Plan::Wait
                    }
                }
            }
        };

        match plan {
            Plan::Wait => {}
            Plan::Start(next, upstream) => self.start_node(next, upstream, ids, actions),
            Plan::Finish(status, result, error) => {
                self.finish_node(parent, status, result, error, ids, actions)
            }
            Plan::HaltChain(skipped, status, error) => {
                for step in skipped {
                    self.mark_cancelled(step);
                }
                self.finish_node(parent, status, None, error, ids, actions);
            }
            Plan::FinishGroup(members) => {
                let (status, error) = self.aggregate(&members);
                let results = members.iter().map(|&m| self.outcome_value(m)).collect();
                self.finish_node(parent, status, Some(Value::Array(results)), error, ids, actions);
            }
            Plan::CancelSiblings(siblings) => {
                for sibling in siblings {
                    self.cancel_subtree(sibling, actions);
                }
            }
            Plan::StartCallback(header, callback) => {
                let results = header.iter().map(|&m| self.outcome_value(m)).collect();
                self.start_node(callback, Some(Value::Array(results)), ids, actions);
            }
            Plan::FinishChord(header, callback) => {
                let (header_status, header_error) = self.aggregate(&header);
                let cb = &self.nodes[callback];
                let status = header_status.worst(cb.status);
                let result = cb.result.clone();
                let error = cb.error.clone().or(header_error);
                self.finish_node(parent, status, result, error, ids, actions);
            }
        }
    }

    /// Worst-case status over members and the first failure detail
    fn aggregate(&self, members: &[usize]) -> (WorkflowStatus, Option<TaskError>) {
        let status = members
            .iter()
            .map(|&m| self.nodes[m].status)
            .fold(WorkflowStatus::Succeeded, WorkflowStatus::worst);
        let error = members.iter().find_map(|&m| self.nodes[m].error.clone());
        (status, error)
    }

    /// Result of a member, or a failure marker
    fn outcome_value(&self, idx: usize) -> Value {
        let node = &self.nodes[idx];
        if node.status == WorkflowStatus::Succeeded {
            return node.result.clone().unwrap_or(Value::Null);
        }
        let mut marker = json!({
            "status": node.status.as_str(),
            "error": node.error,
        });
        if let NodeKind::Task {
            task_id: Some(id), ..
        } = &node.kind
        {
            marker["task_id"] = json!(id);
        }
        marker
    }

    fn mark_cancelled(&mut self, idx: usize) {
        for i in self.subtree(idx) {
            if !self.nodes[i].status.is_terminal() {
                self.nodes[i].status = WorkflowStatus::Cancelled;
            }
        }
    }

    fn cancel_subtree(&mut self, idx: usize, actions: &mut Vec<WorkflowAction>) {
        for i in self.subtree(idx) {
            let node = &mut self.nodes[i];
            match (node.status, &node.kind) {
                (
                    WorkflowStatus::Running,
                    NodeKind::Task {
                        task_id: Some(id), ..
                    },
                ) => actions.push(WorkflowAction::Cancel(*id)),
                (WorkflowStatus::Pending, _) => node.status = WorkflowStatus::Cancelled,
                _ => {}
            }
        }
    }

    fn children(&self, idx: usize) -> Vec<usize> {
        match &self.nodes[idx].kind {
            NodeKind::Task { .. } => Vec::new(),
            NodeKind::Chain { steps, .. } => steps.clone(),
            NodeKind::Group { members, .. } => members.clone(),
            NodeKind::Chord {
                header, callback, ..
            } => header.iter().copied().chain(Some(*callback)).collect(),
        }
    }

    fn subtree(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![idx];
        while let Some(i) = stack.pop() {
            out.push(i);
            stack.extend(self.children(i));
        }
        out
    }

    /// Every task created for this workflow so far
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.nodes
            .iter()
            .filter_map(|n| match n.kind {
                NodeKind::Task { task_id, .. } => task_id,
                _ => None,
            })
            .collect()
    }

    fn node_progress(&self, idx: usize) -> f64 {
        let node = &self.nodes[idx];
        match &node.kind {
            NodeKind::Task { .. } => {
                if node.status.is_terminal() {
                    100.0
                } else {
                    0.0
                }
            }
            NodeKind::Chain { steps, .. } => {
                let done = steps
                    .iter()
                    .filter(|&&s| self.nodes[s].status == WorkflowStatus::Succeeded)
                    .count();
                percent(done, steps.len())
            }
            NodeKind::Group { .. } | NodeKind::Chord { .. } => {
                let members = self.children(idx);
                let done = members
                    .iter()
                    .filter(|&&m| self.nodes[m].status.is_terminal())
                    .count();
                percent(done, members.len())
            }
        }
    }

    /// Aggregate progress: completed steps over total for chains, terminal
    /// members over total for groups and chords
    pub fn progress_percent(&self) -> f64 {
        if self.nodes.is_empty() {
            return 100.0;
        }
        self.node_progress(0)
    }

    /// Read-only view with per-step detail
    ///
    /// `task_status` refines task steps with the live task record status.
    pub fn snapshot(&self, task_status: impl Fn(TaskId) -> Option<TaskStatus>) -> WorkflowSnapshot {
        let steps_idx = match self.nodes.first().map(|n| &n.kind) {
            Some(NodeKind::Task { .. }) => vec![0],
            Some(_) => self.children(0),
            None => Vec::new(),
        };
        let steps: Vec<StepSnapshot> = steps_idx
            .iter()
            .enumerate()
            .map(|(index, &idx)| {
                let node = &self.nodes[idx];
                let (label, status) = match &node.kind {
                    NodeKind::Task { request, task_id } => {
                        let status = task_id
                            .and_then(&task_status)
                            .map(WorkflowStatus::from)
                            .unwrap_or(node.status);
                        (request.kind.as_str().to_string(), status)
                    }
                    NodeKind::Chain { .. } => ("chain".to_string(), node.status),
                    NodeKind::Group { .. } => ("group".to_string(), node.status),
                    NodeKind::Chord { .. } => ("chord".to_string(), node.status),
                };
                let task_ids = self
                    .subtree(idx)
                    .into_iter()
                    .filter_map(|i| match self.nodes[i].kind {
                        NodeKind::Task { task_id, .. } => task_id,
                        _ => None,
                    })
                    .collect();
                StepSnapshot {
                    index,
                    label,
                    status,
                    task_ids,
                    progress_percent: self.node_progress(idx),
                    result: node.result.clone(),
                    error: node.error.clone(),
                }
            })
            .collect();

        let current_step = steps.iter().position(|s| !s.status.is_terminal());
        let root = self.nodes.first();
        WorkflowSnapshot {
            id: self.id,
            status: self.status,
            progress_percent: self.progress_percent(),
            current_step,
            steps,
            result: root.and_then(|n| n.result.clone()),
            error: root.and_then(|n| n.error.clone()),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

fn add_node(nodes: &mut Vec<Node>, composition: Composition, parent: Option<usize>) -> usize {
    let idx = nodes.len();
    nodes.push(Node {
        parent,
        kind: NodeKind::Chain {
            steps: Vec::new(),
            current: 0,
        },
        status: WorkflowStatus::Pending,
        result: None,
        error: None,
    });

    let kind = match composition {
        Composition::Task(request) => NodeKind::Task {
            request,
            task_id: None,
        },
        Composition::Chain(steps) => NodeKind::Chain {
            steps: steps
                .into_iter()
                .map(|c| add_node(nodes, c, Some(idx)))
                .collect(),
            current: 0,
        },
        Composition::Group {
            members,
            on_failure,
        } => {
            let members: Vec<usize> = members
                .into_iter()
                .map(|c| add_node(nodes, c, Some(idx)))
                .collect();
            NodeKind::Group {
                remaining: members.len(),
                members,
                on_failure,
            }
        }
        Composition::Chord { header, callback } => {
            let header: Vec<usize> = header
                .into_iter()
                .map(|c| add_node(nodes, c, Some(idx)))
                .collect();
            let callback = add_node(nodes, Composition::Task(callback), Some(idx));
            NodeKind::Chord {
                remaining: header.len(),
                header,
                callback,
            }
        }
    };
    nodes[idx].kind = kind;
    idx
}

/// One top-level step of a workflow
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    /// Position among the root's children
    pub index: usize,
    /// Task kind for task steps, otherwise "chain", "group" or "chord"
    pub label: String,
    /// Step status
    pub status: WorkflowStatus,
    /// Tasks created for this step so far
    pub task_ids: Vec<TaskId>,
    /// Step progress percentage
    pub progress_percent: f64,
    /// Step result once succeeded
    pub result: Option<Value>,
    /// First failure inside the step
    pub error: Option<TaskError>,
}

/// Aggregated view of a workflow
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Workflow ID
    pub id: WorkflowId,
    /// Aggregate status
    pub status: WorkflowStatus,
    /// Aggregate progress percentage
    pub progress_percent: f64,
    /// First step that is not terminal
    pub current_step: Option<usize>,
    /// Per-step detail
    pub steps: Vec<StepSnapshot>,
    /// Final result once succeeded
    pub result: Option<Value>,
    /// First failure detail
    pub error: Option<TaskError>,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Completion time
    pub finished_at: Option<DateTime<Utc>>,
}
