use super::test_helpers::*;
use super::{CompletionHook, Engine};
use crate::batch::{BatchRequest, ItemStatus};
use crate::composer::{Composition, GroupFailurePolicy};
use crate::config::{WebhookConfig, WebhookEvent};
use crate::error::{Error, FailureKind, TaskError};
use crate::registry::{TaskContext, TaskRegistry};
use crate::task::TaskRequest;
use crate::types::{
    BatchStatus, Event, Priority, TaskId, TaskKind, TaskStatus, WebhookPayload, WorkflowStatus,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod batches;
mod monitor;
mod workflows;
