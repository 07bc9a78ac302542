use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use branchdb_domain::{
    BranchId, Collection, OrderStatus, SubOpStatus, TransactionRecord, TxnState,
};
use branchdb_errors::BranchError;
use branchdb_routing::{Operation, OperationResult};
use branchdb_testing_utils::{ExportSlipBuilder, ImportSlipBuilder, PurchaseOrderBuilder, TestNetwork};

async fn network_with_kho2() -> TestNetwork {
    let net = TestNetwork::new();
    net.stock_warehouse("CN2", "KHO2", &[("VT01", 10), ("VT02", 10)])
        .await
        .unwrap();
    net
}

async fn order_status(net: &TestNetwork, branch: &str, id: &str) -> OrderStatus {
    net.service
        .get_purchase_order(&BranchId::new(branch), id)
        .await
        .unwrap()
        .expect("订单应当存在")
        .status
}

#[tokio::test]
async fn test_order_against_remote_warehouse_commits() {
    let net = network_with_kho2().await;
    let order = PurchaseOrderBuilder::new("DH01").with_line("VT01", 3, 100).build();

    let result = net.service.place_purchase_order(order, None).await.unwrap();
    let OperationResult::Distributed(outcome) = result else {
        panic!("CN1 -> CN2 的订单应当是跨分区事务");
    };
    assert_eq!(outcome.state, TxnState::Committed);

    // 订单只存在于 CN1 的分区
    assert!(net
        .store("p1")
        .inner()
        .get(Collection::PurchaseOrder, "DH01")
        .await
        .unwrap()
        .is_some());
    assert!(net
        .store("p2")
        .inner()
        .get(Collection::PurchaseOrder, "DH01")
        .await
        .unwrap()
        .is_none());
    assert_eq!(net.stock("CN2", "KHO2", "VT01").await, 7);
    assert_eq!(order_status(&net, "CN1", "DH01").await, OrderStatus::Placed);
}

#[tokio::test]
async fn test_insufficient_stock_is_compensated() {
    let net = network_with_kho2().await;
    let order = PurchaseOrderBuilder::new("DH02")
        .with_lines(vec![
            branchdb_domain::OrderLine::new("VT01", 2, 100),
            branchdb_domain::OrderLine::new("VT02", 20, 100),
        ])
        .build();

    let err = net.service.place_purchase_order(order, None).await.unwrap_err();
    assert!(matches!(err, BranchError::TransactionAborted { .. }), "{err:?}");

    assert_eq!(net.stock("CN2", "KHO2", "VT01").await, 10);
    assert_eq!(net.stock("CN2", "KHO2", "VT02").await, 10);
    assert_eq!(order_status(&net, "CN1", "DH02").await, OrderStatus::Failed);
}

#[tokio::test]
async fn test_every_branch_pair_compensates_on_remote_failure() {
    let branches = ["CN1", "CN2", "CN3"];
    for requester in branches {
        for owner in branches.iter().filter(|b| **b != requester) {
            let net = TestNetwork::new();
            let code = format!("KHO_{owner}");
            net.stock_warehouse(owner, &code, &[("VT01", 5)]).await.unwrap();
            net.branch_store(owner).fail_next_applies(10);

            let txn_id = Uuid::new_v4();
            let order = PurchaseOrderBuilder::new("DH10")
                .with_branch(requester)
                .with_warehouse(owner, &code)
                .with_line("VT01", 1, 100)
                .build();
            let err = net
                .service
                .place_purchase_order(order, Some(txn_id))
                .await
                .unwrap_err();
            assert!(
                matches!(err, BranchError::TransactionAborted { .. }),
                "{requester} -> {owner}: {err:?}"
            );

            let record = net.service.transaction(txn_id).await.unwrap().unwrap();
            assert_eq!(record.state, TxnState::Compensated);
            assert_eq!(record.steps[0].status, SubOpStatus::Compensated);
            assert_eq!(record.steps[1].status, SubOpStatus::Failed);
            assert_eq!(record.failed_step, Some(1));

            net.branch_store(owner).fail_next_applies(0);
            assert_eq!(net.stock(owner, &code, "VT01").await, 5);
            assert_eq!(order_status(&net, requester, "DH10").await, OrderStatus::Failed);
        }
    }
}

#[tokio::test]
async fn test_first_step_failure_needs_no_compensation() {
    let net = network_with_kho2().await;
    net.store("p1").fail_next_applies(10);
    let txn_id = Uuid::new_v4();

    let err = net
        .service
        .place_purchase_order(PurchaseOrderBuilder::new("DH03").build(), Some(txn_id))
        .await
        .unwrap_err();
    assert!(matches!(err, BranchError::TransactionAborted { .. }));

    let record = net.service.transaction(txn_id).await.unwrap().unwrap();
    assert_eq!(record.state, TxnState::Compensated);
    assert_eq!(record.failed_step, Some(0));
    assert_eq!(record.steps[0].attempts, 3);
    assert_eq!(record.steps[1].status, SubOpStatus::Pending);
    assert_eq!(net.stock("CN2", "KHO2", "VT01").await, 10);
}

#[tokio::test]
async fn test_repeated_transaction_id_applies_once() {
    let net = network_with_kho2().await;
    let txn_id = Uuid::new_v4();
    let order = PurchaseOrderBuilder::new("DH04").with_line("VT01", 3, 100).build();

    let first = net
        .service
        .place_purchase_order(order.clone(), Some(txn_id))
        .await
        .unwrap();
    let calls = net.store("p2").apply_calls();
    let second = net
        .service
        .place_purchase_order(order, Some(txn_id))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(net.store("p2").apply_calls(), calls);
    assert_eq!(net.stock("CN2", "KHO2", "VT01").await, 7);
}

#[tokio::test]
async fn test_concurrent_call_with_same_transaction_id_is_rejected() {
    let net = network_with_kho2().await;
    net.store("p2").delay_applies(Some(Duration::from_millis(100)));
    let txn_id = Uuid::new_v4();
    let order = PurchaseOrderBuilder::new("DH09").with_line("VT01", 3, 100).build();

    let (first, second) = tokio::join!(
        net.service.place_purchase_order(order.clone(), Some(txn_id)),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            net.service.place_purchase_order(order.clone(), Some(txn_id)).await
        }
    );

    let first = first.unwrap();
    assert!(matches!(second.unwrap_err(), BranchError::PreconditionFailed(_)));
    assert_eq!(first.txn_id(), Some(txn_id));

    // 第一个调用结束后，同一编号返回已有结果且不再派发
    net.store("p2").delay_applies(None);
    let calls = net.store("p2").apply_calls();
    let again = net
        .service
        .place_purchase_order(order, Some(txn_id))
        .await
        .unwrap();
    assert_eq!(again, first);
    assert_eq!(net.store("p2").apply_calls(), calls);

    let record = net.service.transaction(txn_id).await.unwrap().unwrap();
    assert_eq!(record.state, TxnState::Committed);
    assert_eq!(net.stock("CN2", "KHO2", "VT01").await, 7);
    assert_eq!(order_status(&net, "CN1", "DH09").await, OrderStatus::Placed);
}

#[tokio::test]
async fn test_local_operation_with_transaction_id_is_idempotent() {
    let net = TestNetwork::new();
    net.stock_warehouse("CN1", "KHO1", &[("VT01", 1)]).await.unwrap();
    let txn_id = Uuid::new_v4();
    let slip = ImportSlipBuilder::new("PN01").with_line("VT01", 4, 100).build();

    let first = net
        .service
        .execute(Operation::CreateImportSlip(slip.clone()), Some(txn_id))
        .await
        .unwrap();
    let second = net
        .service
        .execute(Operation::CreateImportSlip(slip), Some(txn_id))
        .await
        .unwrap();

    assert!(matches!(
        first,
        OperationResult::Local {
            outcome: branchdb_domain::ApplyOutcome::Applied,
            ..
        }
    ));
    assert!(matches!(
        second,
        OperationResult::Local {
            outcome: branchdb_domain::ApplyOutcome::Duplicate,
            ..
        }
    ));
    assert_eq!(net.stock("CN1", "KHO1", "VT01").await, 5);
}

#[tokio::test]
async fn test_lost_response_is_retried_with_same_token() {
    let net = network_with_kho2().await;
    net.store("p2").lose_next_responses(1);
    let calls = net.store("p2").apply_calls();

    let result = net
        .service
        .place_purchase_order(
            PurchaseOrderBuilder::new("DH05").with_line("VT01", 3, 100).build(),
            None,
        )
        .await
        .unwrap();

    assert!(matches!(result, OperationResult::Distributed(_)));
    // 第一次写入生效但响应丢失，重试返回 Duplicate
    assert_eq!(net.store("p2").apply_calls(), calls + 2);
    assert_eq!(net.stock("CN2", "KHO2", "VT01").await, 7);
}

#[tokio::test]
async fn test_timed_out_step_that_applied_is_undone() {
    let net = network_with_kho2().await;
    // 所有尝试都超时，但第一次实际已经生效
    net.store("p2").lose_next_responses(3);
    let txn_id = Uuid::new_v4();

    let err = net
        .service
        .place_purchase_order(
            PurchaseOrderBuilder::new("DH06").with_line("VT01", 3, 100).build(),
            Some(txn_id),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BranchError::TransactionAborted { .. }), "{err:?}");

    let record = net.service.transaction(txn_id).await.unwrap().unwrap();
    assert_eq!(record.steps[1].status, SubOpStatus::Compensated);
    assert!(!record.steps[1].outcome_unknown);
    assert_eq!(net.stock("CN2", "KHO2", "VT01").await, 10);
    assert_eq!(order_status(&net, "CN1", "DH06").await, OrderStatus::Failed);
}

#[tokio::test]
async fn test_failed_compensation_is_reported_and_can_be_retried() {
    let net = network_with_kho2().await;
    net.store("p1").reject_undo(true);
    let txn_id = Uuid::new_v4();

    let err = net
        .service
        .place_purchase_order(
            PurchaseOrderBuilder::new("DH07").with_line("VT01", 50, 100).build(),
            Some(txn_id),
        )
        .await
        .unwrap_err();
    assert!(err.requires_manual_intervention(), "{err:?}");
    // 补偿失败时订单仍保持 placed
    assert_eq!(order_status(&net, "CN1", "DH07").await, OrderStatus::Placed);

    let report = net.service.reconciliation_report(Utc::now()).await.unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, txn_id);
    assert!(report.failed[0].compensation_error.is_some());

    // 分区恢复后人工重试补偿
    net.store("p1").reject_undo(false);
    let outcome = net.service.retry_compensation(txn_id).await.unwrap();
    assert_eq!(outcome.state, TxnState::Compensated);
    assert_eq!(order_status(&net, "CN1", "DH07").await, OrderStatus::Failed);
    assert!(net
        .service
        .reconciliation_report(Utc::now())
        .await
        .unwrap()
        .is_clean());

    let err = net.service.retry_compensation(txn_id).await.unwrap_err();
    assert!(matches!(err, BranchError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_export_slip_fulfils_remote_order_once() {
    let net = network_with_kho2().await;
    net.service
        .place_purchase_order(
            PurchaseOrderBuilder::new("DH08").with_line("VT01", 3, 100).build(),
            None,
        )
        .await
        .unwrap();

    let slip = ExportSlipBuilder::new("PX01")
        .with_branch("CN2", "KHO2")
        .with_line("VT01", 3, 150)
        .fulfilling("CN1", "DH08")
        .build();
    let result = net.service.create_export_slip(slip, None).await.unwrap();
    assert!(matches!(result, OperationResult::Distributed(_)));

    let order = net
        .service
        .get_purchase_order(&BranchId::new("CN1"), "DH08")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Fulfilled);
    let fulfilled_by = order.fulfilled_by.unwrap();
    assert_eq!(fulfilled_by.branch, BranchId::new("CN2"));
    assert_eq!(fulfilled_by.id, "PX01");
    assert_eq!(net.stock("CN2", "KHO2", "VT01").await, 4);

    // 同一订单不能被第二张出库单履约
    let duplicate = ExportSlipBuilder::new("PX02")
        .with_branch("CN2", "KHO2")
        .with_line("VT01", 1, 150)
        .fulfilling("CN1", "DH08")
        .build();
    let err = net.service.create_export_slip(duplicate, None).await.unwrap_err();
    assert!(matches!(err, BranchError::TransactionAborted { .. }));
    assert_eq!(net.stock("CN2", "KHO2", "VT01").await, 4);
    assert!(net
        .service
        .get_export_slip(&BranchId::new("CN2"), "PX02")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_local_failures_propagate_directly() {
    let net = TestNetwork::new();
    net.stock_warehouse("CN1", "KHO1", &[("VT01", 1)]).await.unwrap();

    let slip = ExportSlipBuilder::new("PX03").with_line("VT01", 2, 100).build();
    let err = net.service.create_export_slip(slip, None).await.unwrap_err();
    assert!(matches!(err, BranchError::InsufficientStock { .. }));

    let err = net
        .service
        .create_warehouse(branchdb_testing_utils::warehouse("CN1", "KHO1"))
        .await
        .unwrap_err();
    assert!(matches!(err, BranchError::DuplicateKey { .. }));

    let err = net
        .service
        .create_warehouse(branchdb_testing_utils::warehouse("CN9", "KHO9"))
        .await
        .unwrap_err();
    assert!(matches!(err, BranchError::UnknownBranch { .. }));
}

#[tokio::test]
async fn test_extreme_stock_adjustments_are_rejected() {
    let net = TestNetwork::new();
    net.stock_warehouse("CN1", "KHO1", &[("VT01", 5)]).await.unwrap();
    let cn1 = BranchId::new("CN1");

    for delta in [i64::MIN, i64::MAX] {
        let err = net
            .service
            .adjust_stock(cn1.clone(), "KHO1", "VT01", delta)
            .await
            .unwrap_err();
        assert!(matches!(err, BranchError::Validation(_)), "{err:?}");
    }
    assert_eq!(net.stock("CN1", "KHO1", "VT01").await, 5);

    let order = PurchaseOrderBuilder::new("DH10")
        .with_line("VT01", i64::MAX, 2)
        .build();
    let err = net.service.place_purchase_order(order, None).await.unwrap_err();
    assert!(matches!(err, BranchError::Validation(_)), "{err:?}");

    // 存储仍然可用
    net.service
        .adjust_stock(cn1, "KHO1", "VT01", 1)
        .await
        .unwrap();
    assert_eq!(net.stock("CN1", "KHO1", "VT01").await, 6);
}

#[tokio::test]
async fn test_unregistered_item_is_rejected() {
    let net = network_with_kho2().await;

    let err = net
        .service
        .adjust_stock(BranchId::new("CN2"), "KHO2", "VT99", 5)
        .await
        .unwrap_err();
    assert!(matches!(err, BranchError::DocumentNotFound { .. }), "{err:?}");

    let order = PurchaseOrderBuilder::new("DH11")
        .with_lines(vec![
            branchdb_domain::OrderLine::new("VT01", 1, 100),
            branchdb_domain::OrderLine::new("VT99", 1, 100),
        ])
        .build();
    let err = net.service.place_purchase_order(order, None).await.unwrap_err();
    assert!(matches!(err, BranchError::TransactionAborted { .. }), "{err:?}");
    assert_eq!(net.stock("CN2", "KHO2", "VT01").await, 10);
    assert_eq!(net.stock("CN2", "KHO2", "VT99").await, 0);
    assert_eq!(order_status(&net, "CN1", "DH11").await, OrderStatus::Failed);
}

#[tokio::test]
async fn test_recover_in_flight_finishes_interrupted_transaction() {
    let net = network_with_kho2().await;
    let operation = Operation::PlacePurchaseOrder(
        PurchaseOrderBuilder::new("DH09").with_line("VT01", 2, 100).build(),
    );
    let routed = net.service.router().route(&operation).unwrap();
    let txn_id = Uuid::new_v4();
    let mut record = TransactionRecord::new(
        txn_id,
        routed.label,
        routed.origin.clone(),
        routed.steps.into_iter().map(|s| s.operation).collect(),
    );
    record.transition(TxnState::InProgress);
    net.service.coordinator().log().create(&record).await.unwrap();

    let outcomes = net.service.recover_in_flight().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].state, TxnState::Committed);
    assert_eq!(net.stock("CN2", "KHO2", "VT01").await, 8);
    assert!(net.service.recover_in_flight().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_purge_keeps_failed_records() {
    let net = network_with_kho2().await;
    let committed = Uuid::new_v4();
    net.service
        .place_purchase_order(PurchaseOrderBuilder::new("DH11").build(), Some(committed))
        .await
        .unwrap();

    net.store("p1").reject_undo(true);
    let failed = Uuid::new_v4();
    net.service
        .place_purchase_order(
            PurchaseOrderBuilder::new("DH12").with_line("VT01", 99, 1).build(),
            Some(failed),
        )
        .await
        .unwrap_err();

    assert_eq!(net.service.purge_expired(Utc::now()).await.unwrap(), 0);
    let later = Utc::now() + chrono::Duration::days(8);
    assert_eq!(net.service.purge_expired(later).await.unwrap(), 1);
    assert!(net.service.transaction(committed).await.unwrap().is_none());
    assert_eq!(
        net.service.transaction(failed).await.unwrap().unwrap().state,
        TxnState::Failed
    );
}
