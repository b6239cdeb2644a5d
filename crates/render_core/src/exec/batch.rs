//! Command batches and submission batches
//!
//! A [`CommandBatch`] collects command buffers together with the semaphores
//! they wait on and signal, then freezes into an immutable [`Submission`].
//! Submissions headed for the same queue are concatenated into a
//! [`SubmissionBatch`] and handed to the context in one call.

use std::ops::AddAssign;

use ash::vk;

use super::{CommandBuffer, ExecError, ExecResult, SemaphorePool};

/// One queue submission: buffers, waits and signals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submission {
    command_buffers: Vec<vk::CommandBuffer>,
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stages: Vec<vk::PipelineStageFlags>,
    signal_semaphores: Vec<vk::Semaphore>,
}

impl Submission {
    /// Submission with no command buffers that only signals
    pub fn signal_only(signal_semaphores: impl Into<Vec<vk::Semaphore>>) -> Self {
        Self {
            signal_semaphores: signal_semaphores.into(),
            ..Self::default()
        }
    }

    /// Command buffers in execution order
    pub fn command_buffers(&self) -> &[vk::CommandBuffer] {
        &self.command_buffers
    }

    /// Semaphores waited on before execution
    pub fn wait_semaphores(&self) -> &[vk::Semaphore] {
        &self.wait_semaphores
    }

    /// Stage mask for each wait semaphore
    pub fn wait_stages(&self) -> &[vk::PipelineStageFlags] {
        &self.wait_stages
    }

    /// Semaphores signaled on completion
    pub fn signal_semaphores(&self) -> &[vk::Semaphore] {
        &self.signal_semaphores
    }

    /// `(semaphore, stage)` wait pairs
    pub fn waits(&self) -> impl Iterator<Item = (vk::Semaphore, vk::PipelineStageFlags)> + '_ {
        self.wait_semaphores.iter().copied().zip(self.wait_stages.iter().copied())
    }

    /// Copy of this submission that additionally waits on `semaphore`
    pub fn with_wait(&self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        let mut submission = self.clone();
        submission.wait_semaphores.push(semaphore);
        submission.wait_stages.push(stage);
        submission
    }

    /// Copy of this submission that additionally signals `semaphore`
    pub fn with_signal(&self, semaphore: vk::Semaphore) -> Self {
        let mut submission = self.clone();
        submission.signal_semaphores.push(semaphore);
        submission
    }

    /// True if the submission has no command buffers, waits or signals
    pub fn is_empty(&self) -> bool {
        self.command_buffers.is_empty() && self.wait_semaphores.is_empty() && self.signal_semaphores.is_empty()
    }
}

/// Lifecycle of a [`CommandBatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Nothing added yet
    Empty,
    /// Buffers, waits or signals have been added
    Recording,
    /// Frozen into a submission
    Built,
}

/// Builder for one [`Submission`]
#[derive(Debug, Clone)]
pub struct CommandBatch {
    submission: Submission,
    state: BatchState,
}

impl Default for CommandBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self {
            submission: Submission::default(),
            state: BatchState::Empty,
        }
    }

    /// Current state
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// True once [`build`](Self::build) has been called
    pub fn is_built(&self) -> bool {
        self.state == BatchState::Built
    }

    fn recording(&mut self) -> ExecResult<&mut Submission> {
        if self.is_built() {
            return Err(ExecError::BatchAlreadyBuilt);
        }
        self.state = BatchState::Recording;
        Ok(&mut self.submission)
    }

    /// Append a command buffer
    pub fn add(&mut self, buffer: impl Into<vk::CommandBuffer>) -> ExecResult<&mut Self> {
        self.recording()?.command_buffers.push(buffer.into());
        Ok(self)
    }

    /// Append command buffers in order
    pub fn add_all<'a>(&mut self, buffers: impl IntoIterator<Item = &'a CommandBuffer>) -> ExecResult<&mut Self> {
        self.recording()?
            .command_buffers
            .extend(buffers.into_iter().map(CommandBuffer::raw));
        Ok(self)
    }

    /// Wait on `semaphore` before `stage` runs
    pub fn wait(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> ExecResult<&mut Self> {
        let submission = self.recording()?;
        submission.wait_semaphores.push(semaphore);
        submission.wait_stages.push(stage);
        Ok(self)
    }

    /// Signal `semaphore` on completion
    pub fn signal(&mut self, semaphore: vk::Semaphore) -> ExecResult<&mut Self> {
        self.recording()?.signal_semaphores.push(semaphore);
        Ok(self)
    }

    /// Make this batch wait, at `stage`, for `producer` to complete
    ///
    /// A semaphore is taken from `pool`, signaled by `producer` and waited on
    /// by `self`. Nothing is acquired when either batch is already built.
    pub fn depends_on(
        &mut self,
        pool: &mut SemaphorePool,
        stage: vk::PipelineStageFlags,
        producer: &mut Self,
    ) -> ExecResult<vk::Semaphore> {
        if self.is_built() || producer.is_built() {
            return Err(ExecError::BatchAlreadyBuilt);
        }

        let semaphore = pool.acquire()?;
        producer.signal(semaphore)?;
        self.wait(semaphore, stage)?;
        Ok(semaphore)
    }

    /// Freeze the batch into a submission
    pub fn build(&mut self) -> ExecResult<Submission> {
        if self.is_built() {
            return Err(ExecError::BatchAlreadyBuilt);
        }
        self.state = BatchState::Built;
        Ok(self.submission.clone())
    }
}

/// Ordered list of submissions for one queue
///
/// `+=` appends; concatenation is associative but not commutative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionBatch {
    submissions: Vec<Submission>,
}

impl SubmissionBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Submissions in order
    pub fn as_slice(&self) -> &[Submission] {
        &self.submissions
    }

    /// Iterate submissions in order
    pub fn iter(&self) -> std::slice::Iter<'_, Submission> {
        self.submissions.iter()
    }

    /// Number of submissions
    pub fn len(&self) -> usize {
        self.submissions.len()
    }

    /// True if there is nothing to submit
    pub fn is_empty(&self) -> bool {
        self.submissions.is_empty()
    }

    /// Append one submission
    pub fn push(&mut self, submission: Submission) {
        self.submissions.push(submission);
    }
}

impl From<Submission> for SubmissionBatch {
    fn from(submission: Submission) -> Self {
        Self {
            submissions: vec![submission],
        }
    }
}

impl From<Vec<Submission>> for SubmissionBatch {
    fn from(submissions: Vec<Submission>) -> Self {
        Self { submissions }
    }
}

impl FromIterator<Submission> for SubmissionBatch {
    fn from_iter<I: IntoIterator<Item = Submission>>(iter: I) -> Self {
        Self {
            submissions: iter.into_iter().collect(),
        }
    }
}

impl Extend<Submission> for SubmissionBatch {
    fn extend<I: IntoIterator<Item = Submission>>(&mut self, iter: I) {
        self.submissions.extend(iter);
    }
}

impl<'a> IntoIterator for &'a SubmissionBatch {
    type Item = &'a Submission;
    type IntoIter = std::slice::Iter<'a, Submission>;

    fn into_iter(self) -> Self::IntoIter {
        self.submissions.iter()
    }
}

impl AddAssign<Submission> for SubmissionBatch {
    fn add_assign(&mut self, submission: Submission) {
        self.submissions.push(submission);
    }
}

impl AddAssign<&Submission> for SubmissionBatch {
    fn add_assign(&mut self, submission: &Submission) {
        self.submissions.push(submission.clone());
    }
}

impl AddAssign<SubmissionBatch> for SubmissionBatch {
    fn add_assign(&mut self, other: SubmissionBatch) {
        self.submissions.extend(other.submissions);
    }
}

impl AddAssign<&SubmissionBatch> for SubmissionBatch {
    fn add_assign(&mut self, other: &SubmissionBatch) {
        self.submissions.extend_from_slice(&other.submissions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn buffer(raw: u64) -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(raw)
    }

    fn tagged(raw: u64) -> Submission {
        let mut batch = CommandBatch::new();
        batch.add(buffer(raw)).unwrap();
        batch.build().unwrap()
    }

    #[test]
    fn test_state_transitions() {
        let mut batch = CommandBatch::new();
        assert_eq!(batch.state(), BatchState::Empty);
        batch.add(buffer(1)).unwrap();
        assert_eq!(batch.state(), BatchState::Recording);
        let submission = batch.build().unwrap();
        assert!(batch.is_built());
        assert_eq!(submission.command_buffers(), &[buffer(1)]);
    }

    #[test]
    fn test_mutation_after_build_fails() {
        let mut batch = CommandBatch::new();
        batch.build().unwrap();
        assert!(matches!(batch.add(buffer(1)), Err(ExecError::BatchAlreadyBuilt)));
        assert!(matches!(
            batch.wait(vk::Semaphore::null(), vk::PipelineStageFlags::TRANSFER),
            Err(ExecError::BatchAlreadyBuilt)
        ));
        assert!(matches!(batch.build(), Err(ExecError::BatchAlreadyBuilt)));
    }

    #[test]
    fn test_waits_keep_stage_pairs() {
        let a = vk::Semaphore::from_raw(10);
        let b = vk::Semaphore::from_raw(11);
        let mut batch = CommandBatch::new();
        batch
            .wait(a, vk::PipelineStageFlags::TRANSFER)
            .unwrap()
            .wait(b, vk::PipelineStageFlags::FRAGMENT_SHADER)
            .unwrap();
        let submission = batch.build().unwrap();
        let waits: Vec<_> = submission.waits().collect();
        assert_eq!(
            waits,
            vec![
                (a, vk::PipelineStageFlags::TRANSFER),
                (b, vk::PipelineStageFlags::FRAGMENT_SHADER)
            ]
        );
    }

    #[test]
    fn test_depends_on_links_producer_and_consumer() {
        let semaphores: Vec<_> = (1..=2).map(vk::Semaphore::from_raw).collect();
        let mut pool = SemaphorePool::from_semaphores(semaphores);
        let mut producer = CommandBatch::new();
        let mut consumer = CommandBatch::new();

        let edge = consumer
            .depends_on(&mut pool, vk::PipelineStageFlags::VERTEX_INPUT, &mut producer)
            .unwrap();

        assert_eq!(pool.in_use(), 1);
        let producer = producer.build().unwrap();
        let consumer = consumer.build().unwrap();
        assert_eq!(producer.signal_semaphores(), &[edge]);
        assert_eq!(consumer.wait_semaphores(), &[edge]);
        assert_eq!(consumer.wait_stages(), &[vk::PipelineStageFlags::VERTEX_INPUT]);
    }

    #[test]
    fn test_depends_on_built_producer_acquires_nothing() {
        let mut pool = SemaphorePool::from_semaphores(vec![vk::Semaphore::from_raw(1)]);
        let mut producer = CommandBatch::new();
        producer.build().unwrap();
        let mut consumer = CommandBatch::new();

        let result = consumer.depends_on(&mut pool, vk::PipelineStageFlags::TRANSFER, &mut producer);
        assert!(matches!(result, Err(ExecError::BatchAlreadyBuilt)));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_submission_batch_concatenation_order() {
        let mut a = SubmissionBatch::from(tagged(1));
        let b: SubmissionBatch = [tagged(2), tagged(3)].into_iter().collect();

        a += &b;
        a += tagged(4);
        a += b;

        let order: Vec<_> = a.iter().map(|s| s.command_buffers()[0]).collect();
        assert_eq!(order, vec![buffer(1), buffer(2), buffer(3), buffer(4), buffer(2), buffer(3)]);
    }

    #[test]
    fn test_concatenation_is_associative() {
        let (x, y, z) = (
            SubmissionBatch::from(tagged(1)),
            SubmissionBatch::from(tagged(2)),
            SubmissionBatch::from(tagged(3)),
        );

        let mut left = x.clone();
        left += &y;
        left += &z;

        let mut yz = y.clone();
        yz += &z;
        let mut right = x;
        right += yz;

        assert_eq!(left, right);
    }

    #[test]
    fn test_signal_only_submission() {
        let submission = Submission::signal_only(vec![vk::Semaphore::from_raw(7)]);
        assert!(submission.command_buffers().is_empty());
        assert!(!submission.is_empty());
        assert!(Submission::default().is_empty());
    }
}
