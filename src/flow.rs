//! Parent/child flows: trees of jobs with dependency gating.
//!
//! Children are enqueued before their parent, each registering itself in the
//! parent's dependency set; the parent enters `waiting-children` and becomes
//! runnable only once every child has completed. All nodes of a flow share one
//! queue, keeping dependency resolution inside a single atomic script.

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::models::{GantryError, GantryResult, JobOptions};
use crate::queue::Queue;

/// One node of a flow tree.
#[derive(Clone, Debug)]
pub struct FlowNode {
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
    pub children: Vec<FlowNode>,
}

impl FlowNode {
    pub fn new<S: Into<String>>(name: S, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
            opts: JobOptions::default(),
            children: Vec::new(),
        }
    }

    pub fn with_opts(mut self, opts: JobOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_children(mut self, children: Vec<FlowNode>) -> Self {
        self.children = children;
        self
    }
}

/// The job IDs a flow tree resolved to, mirroring its shape.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowJobIds {
    pub id: String,
    pub children: Vec<FlowJobIds>,
}

/// Enqueues flow trees against a queue.
pub struct FlowProducer {
    queue: Queue,
}

impl FlowProducer {
    pub fn new(queue: Queue) -> Self {
        Self { queue }
    }

    /// Enqueue a whole tree, children first. Returns the assigned IDs.
    pub async fn add_flow(&self, root: FlowNode) -> GantryResult<FlowJobIds> {
        self.add_node(root, None).await
    }

    fn add_node(
        &self,
        node: FlowNode,
        parent_key: Option<String>,
    ) -> BoxFuture<'_, GantryResult<FlowJobIds>> {
        Box::pin(async move {
            if node.children.is_empty() {
                let mut args = self.queue.build_add_args(&node.name, &node.data, node.opts)?;
                args.parent_key = parent_key;
                let id = self.queue.add_raw(&args).await?;
                return Ok(FlowJobIds {
                    id,
                    children: Vec::new(),
                });
            }

            if node.opts.delay > 0 {
                return Err(GantryError::invalid(
                    "flow parents cannot be delayed; they wait on their children",
                ));
            }

            // the parent id must be known before its children reference it
            let parent_id = node
                .opts
                .job_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let parent_job_key = self.queue.keys().job(&parent_id);

            let mut children = Vec::with_capacity(node.children.len());
            for child in node.children {
                children.push(self.add_node(child, Some(parent_job_key.clone())).await?);
            }

            let mut opts = node.opts;
            opts.job_id = Some(parent_id);
            let mut args = self.queue.build_add_args(&node.name, &node.data, opts)?;
            // the children hold the exact parent key; a limiter suffix would break it
            args.group_suffix = None;
            args.parent_key = parent_key;
            args.waiting_children = true;
            let id = self.queue.add_raw(&args).await?;
            Ok(FlowJobIds { id, children })
        })
    }
}
