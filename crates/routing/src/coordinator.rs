use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use branchdb_config::CoordinatorConfig;
use branchdb_domain::{
    ApplyOutcome, IdempotencyToken, Mutation, PartitionId, SubOpStatus, TokenPhase,
    TransactionOutcome, TransactionRecord, TxnState,
};
use branchdb_errors::{BranchError, BranchResult};
use branchdb_infrastructure::observability::{record_sub_operation_retry, record_transaction};
use branchdb_infrastructure::SessionManager;

use crate::retry::RetryPolicy;
use crate::router::RoutedOperation;
use crate::txn_log::TransactionLog;

/// 子操作派发失败
struct DispatchFailure {
    error: BranchError,
    attempts: u32,
    /// 至少一次尝试超时，写入是否生效未知
    uncertain: bool,
}

/// 对账报告：需要人工处理的事务
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub generated_at: DateTime<Utc>,
    pub failed: Vec<TransactionRecord>,
    /// 长时间停留在非终态的事务
    pub stuck: Vec<TransactionRecord>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.stuck.is_empty()
    }
}

/// 本进程内正在驱动的事务编号，离开作用域时释放
struct InFlightClaim<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    txn_id: Uuid,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.txn_id);
    }
}

/// 跨分支事务协调器：顺序执行各分区子操作，失败时按完成顺序的逆序补偿
pub struct TransactionCoordinator {
    sessions: Arc<SessionManager>,
    log: Arc<dyn TransactionLog>,
    config: CoordinatorConfig,
    retry: RetryPolicy,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl TransactionCoordinator {
    pub fn new(
        sessions: Arc<SessionManager>,
        log: Arc<dyn TransactionLog>,
        config: CoordinatorConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            sessions,
            log,
            config,
            retry,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn log(&self) -> &Arc<dyn TransactionLog> {
        &self.log
    }

    /// 同一事务同一时刻只允许一个执行者
    fn claim(&self, txn_id: Uuid) -> BranchResult<InFlightClaim<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(txn_id) {
            return Err(BranchError::PreconditionFailed(format!(
                "事务 {txn_id} 正在由其他调用执行"
            )));
        }
        Ok(InFlightClaim {
            set: &self.in_flight,
            txn_id,
        })
    }

    /// 执行跨分区操作。相同 txn_id 的重复调用：已结束的直接返回原结果，
    /// 未结束的（进程中断）从持久化的步骤状态继续，
    /// 本进程内仍在执行中的返回 PreconditionFailed。
    pub async fn execute(
        &self,
        txn_id: Uuid,
        routed: RoutedOperation,
    ) -> BranchResult<TransactionOutcome> {
        let _claim = self.claim(txn_id)?;
        if let Some(existing) = self.log.get(txn_id).await? {
            if existing.state.is_terminal() {
                debug!("事务 {} 已结束 ({})，返回已有结果", txn_id, existing.state.as_str());
                return Ok(existing.outcome());
            }
            info!("恢复未完成的事务 {} ({})", txn_id, existing.state.as_str());
            return self.drive(existing).await;
        }

        let steps = routed.steps.into_iter().map(|s| s.operation).collect();
        let record = TransactionRecord::new(txn_id, routed.label, routed.origin, steps);
        if let Err(e) = self.log.create(&record).await {
            if matches!(e, BranchError::DuplicateKey { .. }) {
                return Err(BranchError::PreconditionFailed(format!(
                    "事务 {txn_id} 正在由其他调用执行"
                )));
            }
            return Err(e);
        }
        info!(
            "事务 {} ({}) 开始，涉及 {} 个分区",
            txn_id,
            record.label,
            record.steps.len()
        );
        self.drive(record).await
    }

    async fn drive(&self, mut record: TransactionRecord) -> BranchResult<TransactionOutcome> {
        if matches!(record.state, TxnState::Initiated | TxnState::InProgress) {
            self.run_forward(&mut record).await?;
        }
        if record.state == TxnState::Compensating {
            self.run_compensation(&mut record).await?;
        }
        record_transaction(record.state.as_str());
        Ok(record.outcome())
    }

    async fn run_forward(&self, record: &mut TransactionRecord) -> BranchResult<()> {
        record.transition(TxnState::InProgress);
        self.log.update(record).await?;

        for index in 0..record.steps.len() {
            if record.steps[index].status == SubOpStatus::Committed {
                continue;
            }
            let step = &record.steps[index];
            let token = step.token(record.id, TokenPhase::Apply);
            let partition = step.partition.clone();
            let result = self.dispatch(&partition, &token, &step.apply).await;

            let step = &mut record.steps[index];
            match result {
                Ok(outcome) => {
                    step.status = SubOpStatus::Committed;
                    step.attempts += 1;
                    step.outcome_unknown = false;
                    step.completed_at = Some(Utc::now());
                    if outcome == ApplyOutcome::Duplicate {
                        debug!("事务 {} 子操作 {} 已经应用过", record.id, index);
                    }
                    self.log.update(record).await?;
                }
                Err(failure) => {
                    let message = format!(
                        "子操作 {} ({}) 在分区 {} 失败: {}",
                        index, step.description, partition, failure.error
                    );
                    warn!("事务 {}: {}", record.id, message);
                    step.status = SubOpStatus::Failed;
                    step.attempts += failure.attempts;
                    step.outcome_unknown = failure.uncertain;
                    step.last_error = Some(failure.error.to_string());
                    record.failure = Some(message);
                    record.failed_step = Some(index);
                    record.transition(TxnState::Compensating);
                    self.log.update(record).await?;
                    return Ok(());
                }
            }
        }

        record.transition(TxnState::Committed);
        self.log.update(record).await?;
        info!("事务 {} ({}) 已提交", record.id, record.label);
        Ok(())
    }

    /// 撤销已提交的子操作，按完成时间倒序执行
    async fn run_compensation(&self, record: &mut TransactionRecord) -> BranchResult<()> {
        // 超时的子操作可能已经生效，先确认再决定是否撤销
        for index in 0..record.steps.len() {
            let step = &record.steps[index];
            if step.status != SubOpStatus::Failed || !step.outcome_unknown {
                continue;
            }
            let token = step.token(record.id, TokenPhase::Apply);
            let partition = step.partition.clone();
            match self.was_applied(&partition, &token).await {
                Ok(applied) => {
                    let step = &mut record.steps[index];
                    step.outcome_unknown = false;
                    if applied {
                        info!("事务 {} 子操作 {} 超时后实际已生效，需要撤销", record.id, index);
                        step.status = SubOpStatus::Committed;
                        step.completed_at = Some(Utc::now());
                    }
                }
                Err(e) => {
                    return self
                        .fail_compensation(record, format!("无法确认子操作 {index} 的结果: {e}"))
                        .await;
                }
            }
        }

        let mut order: Vec<usize> = record
            .committed_steps()
            .map(|s| s.index)
            .collect();
        order.sort_by(|a, b| {
            let (sa, sb) = (&record.steps[*a], &record.steps[*b]);
            sb.completed_at.cmp(&sa.completed_at).then(b.cmp(a))
        });

        if order.is_empty() {
            debug!("事务 {} 没有需要撤销的子操作", record.id);
        }

        for index in order {
            let step = &record.steps[index];
            let token = step.token(record.id, TokenPhase::Undo);
            let partition = step.partition.clone();
            let result = if step.undo.is_empty() {
                Ok(ApplyOutcome::Applied)
            } else {
                self.dispatch(&partition, &token, &step.undo).await
            };

            match result {
                Ok(_) => {
                    let step = &mut record.steps[index];
                    step.status = SubOpStatus::Compensated;
                    self.log.update(record).await?;
                }
                Err(failure) => {
                    let step = &mut record.steps[index];
                    step.attempts += failure.attempts;
                    step.last_error = Some(failure.error.to_string());
                    return self
                        .fail_compensation(
                            record,
                            format!("撤销子操作 {} 在分区 {} 失败: {}", index, partition, failure.error),
                        )
                        .await;
                }
            }
        }

        record.compensation_error = None;
        record.transition(TxnState::Compensated);
        self.log.update(record).await?;
        info!(
            "事务 {} ({}) 已补偿: {}",
            record.id,
            record.label,
            record.failure.as_deref().unwrap_or("")
        );
        Ok(())
    }

    async fn fail_compensation(
        &self,
        record: &mut TransactionRecord,
        message: String,
    ) -> BranchResult<()> {
        error!("事务 {} 补偿失败，需要人工处理: {}", record.id, message);
        record.compensation_error = Some(message);
        record.transition(TxnState::Failed);
        self.log.update(record).await
    }

    async fn was_applied(
        &self,
        partition: &PartitionId,
        token: &IdempotencyToken,
    ) -> BranchResult<bool> {
        let mut attempt = 0;
        loop {
            let result = match self.sessions.handle(partition) {
                Ok(store) => match timeout(self.config.sub_operation_timeout(), store.is_applied(token)).await {
                    Ok(result) => result,
                    Err(_) => Err(self.timeout_error(partition)),
                },
                Err(e) => Err(e),
            };
            match result {
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    self.backoff(partition, attempt, &e).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// 派发一批写操作：可重试错误使用同一令牌重试，业务拒绝立即返回
    async fn dispatch(
        &self,
        partition: &PartitionId,
        token: &IdempotencyToken,
        mutations: &[Mutation],
    ) -> Result<ApplyOutcome, DispatchFailure> {
        let mut attempt = 0;
        let mut uncertain = false;
        loop {
            let result = match self.sessions.handle(partition) {
                Ok(store) => {
                    match timeout(self.config.sub_operation_timeout(), store.apply(token, mutations)).await {
                        Ok(result) => result,
                        Err(_) => Err(self.timeout_error(partition)),
                    }
                }
                Err(e) => Err(e),
            };
            if matches!(result, Err(BranchError::Timeout(_))) {
                uncertain = true;
            }

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    self.backoff(partition, attempt, &e).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(DispatchFailure {
                        error,
                        attempts: attempt + 1,
                        uncertain,
                    })
                }
            }
        }
    }

    fn timeout_error(&self, partition: &PartitionId) -> BranchError {
        BranchError::Timeout(format!(
            "分区 {} 在 {}ms 内没有响应",
            partition, self.config.sub_operation_timeout_ms
        ))
    }

    async fn backoff(&self, partition: &PartitionId, attempt: u32, error: &BranchError) {
        let delay: Duration = self.retry.delay(attempt);
        record_sub_operation_retry(partition.as_str());
        warn!(
            "分区 {} 操作失败，{}ms 后第 {} 次重试: {}",
            partition,
            delay.as_millis(),
            attempt + 1,
            error
        );
        sleep(delay).await;
    }

    /// 运维操作：重新执行 FAILED 事务的补偿
    pub async fn retry_compensation(&self, txn_id: Uuid) -> BranchResult<TransactionOutcome> {
        let _claim = self.claim(txn_id)?;
        let mut record = self
            .log
            .get(txn_id)
            .await?
            .ok_or_else(|| BranchError::not_found("CrossBranchTxn", txn_id.to_string()))?;
        if record.state != TxnState::Failed {
            return Err(BranchError::PreconditionFailed(format!(
                "事务 {} 当前状态为 {}，只有 FAILED 事务可以重新补偿",
                txn_id,
                record.state.as_str()
            )));
        }

        info!("重新补偿事务 {}", txn_id);
        record.transition(TxnState::Compensating);
        self.log.update(&mut record).await?;
        self.run_compensation(&mut record).await?;
        record_transaction(record.state.as_str());
        Ok(record.outcome())
    }

    /// 列出 FAILED 事务和长时间未结束的事务
    pub async fn reconciliation_report(&self, now: DateTime<Utc>) -> BranchResult<ReconciliationReport> {
        let failed = self.log.list_by_state(&[TxnState::Failed]).await?;
        let threshold = now - chrono::Duration::from_std(self.config.stuck_after()).unwrap_or_default();
        let stuck = self
            .log
            .list_by_state(&[TxnState::Initiated, TxnState::InProgress, TxnState::Compensating])
            .await?
            .into_iter()
            .filter(|r| r.updated_at < threshold)
            .collect();
        Ok(ReconciliationReport {
            generated_at: now,
            failed,
            stuck,
        })
    }

    /// 继续执行所有未结束的事务（启动时调用）
    pub async fn recover_in_flight(&self) -> BranchResult<Vec<TransactionOutcome>> {
        let pending = self
            .log
            .list_by_state(&[TxnState::Initiated, TxnState::InProgress, TxnState::Compensating])
            .await?;
        if !pending.is_empty() {
            info!("发现 {} 个未完成的事务，开始恢复", pending.len());
        }
        let mut outcomes = Vec::with_capacity(pending.len());
        for record in pending {
            let Ok(_claim) = self.claim(record.id) else {
                debug!("事务 {} 正在执行中，跳过恢复", record.id);
                continue;
            };
            outcomes.push(self.drive(record).await?);
        }
        Ok(outcomes)
    }

    /// 清理超过保留期的 COMMITTED / COMPENSATED 记录，FAILED 记录永不自动清理
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> BranchResult<usize> {
        let cutoff = now - chrono::Duration::from_std(self.config.retention()).unwrap_or_default();
        let expired: Vec<Uuid> = self
            .log
            .list_by_state(&[TxnState::Committed, TxnState::Compensated])
            .await?
            .into_iter()
            .filter(|r| r.updated_at < cutoff)
            .map(|r| r.id)
            .collect();
        for id in &expired {
            self.log.remove(*id).await?;
        }
        if !expired.is_empty() {
            info!("清理了 {} 条过期事务记录", expired.len());
        }
        Ok(expired.len())
    }
}
