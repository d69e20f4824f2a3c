//! 财务算术原语：整数分精度
//!
//! 金额一律换算为整数分（i64）参与运算，出入口为美元浮点。
//! 货币运算绝不信任浮点：边界用例（2.04% vs 2.0% 方差阈值）决定审批走向。
//! 同时把这些原语包装成本地 finance_* 工具：模型照常发工具调用，
//! worker 在转发 RPC 之前拦截并本地执行，零网络往返。

use serde_json::{json, Value};

use crate::tools::ToolSchema;

#[inline]
fn to_cents(dollars: f64) -> i64 {
    (dollars * 100.0).round() as i64
}

#[inline]
fn to_dollars(cents: i64) -> f64 {
    cents as f64 / 100.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ── 按期分摊 ────────────────────────────────────────────────────────────

/// 用掉 days_used 天后的剩余价值（如 12 个月合同用了 7 个月）
pub fn prorated_amount(total: f64, days_used: i64, total_days: i64) -> f64 {
    if total_days <= 0 {
        return 0.0;
    }
    let remaining = (total_days - days_used).max(0);
    to_dollars((to_cents(total) as f64 * remaining as f64 / total_days as f64).round() as i64)
}

/// 单期可确认金额（如年付合同的一个月）
pub fn prorated_for_period(total: f64, total_periods: i64) -> f64 {
    if total_periods <= 0 {
        return 0.0;
    }
    to_dollars(((to_cents(total) as f64) / total_periods as f64).round() as i64)
}

// ── 提前终止费 ──────────────────────────────────────────────────────────

/// 扣除提前终止费后的净退款；fee_pct=10 表示 10%
pub fn apply_early_termination_fee(remaining_value: f64, fee_pct: f64) -> f64 {
    let cents = to_cents(remaining_value);
    let fee = ((cents as f64) * fee_pct / 100.0).round() as i64;
    to_dollars(cents - fee)
}

// ── 方差检查 ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct VarianceCheck {
    pub exceeds: bool,
    pub variance: f64,
    /// 原始百分比，不早期取整：2.04% 与 2.0% 的差决定审批路由
    pub pct: f64,
}

pub fn apply_variance_check(invoiced: f64, po_amount: f64, threshold_pct: f64) -> VarianceCheck {
    if po_amount == 0.0 {
        return VarianceCheck {
            exceeds: false,
            variance: 0.0,
            pct: 0.0,
        };
    }
    let variance = invoiced - po_amount;
    let pct = (variance / po_amount).abs() * 100.0;
    VarianceCheck {
        exceeds: pct > threshold_pct,
        variance: round2(variance),
        pct: (pct * 1e6).round() / 1e6,
    }
}

// ── SLA 赔偿 ────────────────────────────────────────────────────────────

/// 每超出 sla_max_mins 一档记 credit_pct_per_breach%，封顶 cap_pct%
pub fn compute_sla_credit(
    downtime_mins: f64,
    sla_max_mins: f64,
    invoice_amount: f64,
    credit_pct_per_breach: f64,
    cap_pct: f64,
) -> f64 {
    if downtime_mins <= sla_max_mins || sla_max_mins <= 0.0 {
        return 0.0;
    }
    let excess = downtime_mins - sla_max_mins;
    let breach_count = (excess / sla_max_mins).ceil();
    let applied_pct = (breach_count * credit_pct_per_breach).min(cap_pct);
    to_dollars(((to_cents(invoice_amount) as f64) * applied_pct / 100.0).round() as i64)
}

// ── 保险分项限额 ────────────────────────────────────────────────────────

/// 分项限额，附加险限额更高时覆盖
pub fn apply_sub_limit(claimed: f64, sub_limit: f64, rider_limit: Option<f64>) -> f64 {
    let effective = match rider_limit {
        Some(r) if r > sub_limit => r,
        _ => sub_limit,
    };
    to_dollars(to_cents(claimed).min(to_cents(effective)))
}

// ── 礼品卡余额容量 ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GiftCardCapacity {
    pub fits: bool,
    pub overflow: f64,
    pub projected_balance: f64,
}

pub fn gift_card_capacity(current_balance: f64, incoming: f64, capacity_limit: f64) -> GiftCardCapacity {
    let projected = current_balance + incoming;
    GiftCardCapacity {
        fits: projected <= capacity_limit,
        overflow: round2((projected - capacity_limit).max(0.0)),
        projected_balance: round2(projected),
    }
}

// ── 贷款摊还 ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AmortizationPayment {
    pub month: u32,
    pub payment: f64,
    pub principal: f64,
    pub interest: f64,
    pub balance: f64,
}

/// 标准等额本息摊还表
pub fn amortize_loan(principal: f64, annual_rate_pct: f64, months: u32) -> Vec<AmortizationPayment> {
    if months == 0 {
        return Vec::new();
    }
    if annual_rate_pct == 0.0 {
        let pmt = ((to_cents(principal) as f64) / months as f64).round() as i64;
        let mut balance = to_cents(principal);
        return (1..=months)
            .map(|m| {
                let pay = pmt.min(balance);
                balance -= pay;
                AmortizationPayment {
                    month: m,
                    payment: to_dollars(pay),
                    principal: to_dollars(pay),
                    interest: 0.0,
                    balance: to_dollars(balance.max(0)),
                }
            })
            .collect();
    }

    let r = annual_rate_pct / 100.0 / 12.0;
    let factor = (1.0 + r).powi(months as i32);
    let pmt_cents = ((to_cents(principal) as f64) * r * factor / (factor - 1.0)).round() as i64;
    let mut balance_cents = to_cents(principal);
    let mut schedule = Vec::with_capacity(months as usize);

    for m in 1..=months {
        let interest_cents = ((balance_cents as f64) * r).round() as i64;
        let pay_cents = pmt_cents.min(balance_cents + interest_cents);
        let principal_cents = pay_cents - interest_cents;
        balance_cents -= principal_cents;
        schedule.push(AmortizationPayment {
            month: m,
            payment: to_dollars(pay_cents),
            principal: to_dollars(principal_cents),
            interest: to_dollars(interest_cents),
            balance: to_dollars(balance_cents.max(0)),
        });
    }
    schedule
}

pub fn payment_plan_summary(schedule: &[AmortizationPayment]) -> Value {
    if schedule.is_empty() {
        return json!({});
    }
    let total_paid: f64 = schedule.iter().map(|p| p.payment).sum();
    let total_interest: f64 = schedule.iter().map(|p| p.interest).sum();
    json!({
        "monthly_payment": schedule[0].payment,
        "months": schedule.len(),
        "total_paid": round2(total_paid),
        "total_interest": round2(total_interest),
    })
}

// ── 折旧 ────────────────────────────────────────────────────────────────

/// 月直线折旧额
pub fn straight_line_depreciation(cost: f64, salvage: f64, useful_life_months: u32) -> f64 {
    if useful_life_months == 0 {
        return 0.0;
    }
    let depreciable = to_cents(cost) - to_cents(salvage);
    to_dollars(((depreciable as f64) / useful_life_months as f64).round() as i64)
}

pub fn depreciation_schedule(cost: f64, salvage: f64, useful_life_months: u32) -> Vec<Value> {
    let monthly = straight_line_depreciation(cost, salvage, useful_life_months);
    let mut book_value = cost;
    (1..=useful_life_months)
        .map(|m| {
            let dep = monthly.min(round2(book_value - salvage).max(0.0));
            book_value = to_dollars(to_cents(book_value) - to_cents(dep));
            json!({"month": m, "depreciation": dep, "book_value": book_value})
        })
        .collect()
}

// ── 收入确认 ────────────────────────────────────────────────────────────

/// 预付合同直线法收入确认：本期已确认与递延余额
pub fn recognize_revenue(contract_value: f64, contract_months: u32, periods_elapsed: u32) -> Value {
    if contract_months == 0 {
        return json!({"recognized_per_period": 0.0, "recognized_total": 0.0, "deferred": 0.0});
    }
    let per_period = ((to_cents(contract_value) as f64) / contract_months as f64).round() as i64;
    let recognized = (per_period * periods_elapsed as i64).min(to_cents(contract_value));
    json!({
        "recognized_per_period": to_dollars(per_period),
        "recognized_total": to_dollars(recognized),
        "deferred": to_dollars(to_cents(contract_value) - recognized),
    })
}

// ── 订单净差额 ──────────────────────────────────────────────────────────

/// 订单修改的净价差；负值表示应退客户
pub fn net_price_delta(
    original_items: &[(String, f64)],
    modified_items: &[(String, f64)],
    cancelled_ids: &[String],
) -> Value {
    use std::collections::BTreeMap;
    let orig: BTreeMap<&str, i64> = original_items
        .iter()
        .map(|(id, p)| (id.as_str(), to_cents(*p)))
        .collect();
    let modified: BTreeMap<&str, i64> = modified_items
        .iter()
        .map(|(id, p)| (id.as_str(), to_cents(*p)))
        .collect();

    let all_ids: std::collections::BTreeSet<&str> =
        orig.keys().chain(modified.keys()).copied().collect();
    let mut delta_cents: i64 = 0;
    let mut breakdown = Vec::new();

    for id in all_ids {
        let before = orig.get(id).copied().unwrap_or(0);
        let (after, action) = if cancelled_ids.iter().any(|c| c == id) {
            (0, "cancelled")
        } else {
            let after = modified.get(id).copied().unwrap_or(before);
            (after, if after != before { "modified" } else { "unchanged" })
        };
        let item_delta = after - before;
        delta_cents += item_delta;
        breakdown.push(json!({
            "id": id, "action": action,
            "original": to_dollars(before), "new": to_dollars(after), "delta": to_dollars(item_delta),
        }));
    }

    let direction = if delta_cents < 0 {
        "refund"
    } else if delta_cents > 0 {
        "charge"
    } else {
        "no_change"
    };
    json!({"net_delta": to_dollars(delta_cents), "direction": direction, "breakdown": breakdown})
}

// ── 本地 finance_* 工具面 ───────────────────────────────────────────────

/// 注入模型工具集的本地财务工具定义
pub fn finance_tool_definitions() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: "finance_variance_check".into(),
            description: "Check invoice vs PO variance. Returns whether variance exceeds threshold and exact percentage.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "invoiced": {"type": "number"},
                    "po_amount": {"type": "number"},
                    "threshold_pct": {"type": "number"},
                },
                "required": ["invoiced", "po_amount", "threshold_pct"],
            }),
        },
        ToolSchema {
            name: "finance_prorated_amount".into(),
            description: "Calculate prorated remaining value for partial period usage.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "total": {"type": "number"},
                    "days_used": {"type": "integer"},
                    "total_days": {"type": "integer"},
                },
                "required": ["total", "days_used", "total_days"],
            }),
        },
        ToolSchema {
            name: "finance_sla_credit".into(),
            description: "Compute SLA breach credit from downtime minutes, per-breach percentage and cap.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "downtime_minutes": {"type": "number"},
                    "sla_max_minutes": {"type": "number"},
                    "invoice_amount": {"type": "number"},
                    "credit_pct_per_breach": {"type": "number"},
                    "cap_pct": {"type": "number"},
                },
                "required": ["downtime_minutes", "sla_max_minutes", "invoice_amount", "credit_pct_per_breach", "cap_pct"],
            }),
        },
        ToolSchema {
            name: "finance_early_termination".into(),
            description: "Calculate net refund after early termination fee deduction.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "remaining_value": {"type": "number"},
                    "fee_pct": {"type": "number"},
                },
                "required": ["remaining_value", "fee_pct"],
            }),
        },
        ToolSchema {
            name: "finance_loan_amortization".into(),
            description: "Generate a loan amortization schedule with monthly payment breakdown.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "principal": {"type": "number"},
                    "annual_rate_pct": {"type": "number"},
                    "months": {"type": "integer"},
                },
                "required": ["principal", "annual_rate_pct", "months"],
            }),
        },
        ToolSchema {
            name: "finance_revenue_recognition".into(),
            description: "Calculate recognized and deferred revenue for a contract period.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "contract_value": {"type": "number"},
                    "contract_months": {"type": "integer"},
                    "periods_elapsed": {"type": "integer"},
                },
                "required": ["contract_value", "contract_months", "periods_elapsed"],
            }),
        },
        ToolSchema {
            name: "finance_depreciation".into(),
            description: "Calculate straight-line monthly depreciation for an asset.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "cost": {"type": "number"},
                    "salvage": {"type": "number"},
                    "useful_life_months": {"type": "integer"},
                },
                "required": ["cost", "salvage", "useful_life_months"],
            }),
        },
    ]
}

pub fn is_finance_tool(tool_name: &str) -> bool {
    tool_name.starts_with("finance_")
}

fn num(params: &Value, key: &str) -> Option<f64> {
    params.get(key).and_then(|v| v.as_f64())
}

/// finance_* 工具本地分派；入参错误返回 error 结果而不是崩溃
pub fn call_finance_tool(tool_name: &str, params: &Value) -> Value {
    let missing = |key: &str| json!({"error": format!("missing parameter: {}", key), "tool": tool_name});

    match tool_name {
        "finance_variance_check" => {
            let (Some(invoiced), Some(po), Some(threshold)) = (
                num(params, "invoiced"),
                num(params, "po_amount"),
                num(params, "threshold_pct"),
            ) else {
                return missing("invoiced/po_amount/threshold_pct");
            };
            let r = apply_variance_check(invoiced, po, threshold);
            json!({"result": {"exceeds": r.exceeds, "variance": r.variance, "pct": r.pct}, "precision": "integer_cents"})
        }
        "finance_prorated_amount" => {
            let (Some(total), Some(days_used), Some(total_days)) = (
                num(params, "total"),
                num(params, "days_used"),
                num(params, "total_days"),
            ) else {
                return missing("total/days_used/total_days");
            };
            json!({"prorated_amount": prorated_amount(total, days_used as i64, total_days as i64), "currency": "USD", "precision": "integer_cents"})
        }
        "finance_sla_credit" => {
            let (Some(downtime), Some(sla_max), Some(invoice), Some(per_breach), Some(cap)) = (
                num(params, "downtime_minutes"),
                num(params, "sla_max_minutes"),
                num(params, "invoice_amount"),
                num(params, "credit_pct_per_breach"),
                num(params, "cap_pct"),
            ) else {
                return missing("downtime_minutes/sla_max_minutes/invoice_amount/credit_pct_per_breach/cap_pct");
            };
            json!({"sla_credit": compute_sla_credit(downtime, sla_max, invoice, per_breach, cap), "currency": "USD", "precision": "integer_cents"})
        }
        "finance_early_termination" => {
            let (Some(remaining), Some(fee)) =
                (num(params, "remaining_value"), num(params, "fee_pct"))
            else {
                return missing("remaining_value/fee_pct");
            };
            json!({"net_refund": apply_early_termination_fee(remaining, fee), "currency": "USD", "precision": "integer_cents"})
        }
        "finance_loan_amortization" => {
            let (Some(principal), Some(rate), Some(months)) = (
                num(params, "principal"),
                num(params, "annual_rate_pct"),
                num(params, "months"),
            ) else {
                return missing("principal/annual_rate_pct/months");
            };
            let schedule = amortize_loan(principal, rate, months as u32);
            let first: Vec<Value> = schedule
                .iter()
                .take(3)
                .map(|p| {
                    json!({"month": p.month, "payment": p.payment, "principal": p.principal,
                           "interest": p.interest, "balance": p.balance})
                })
                .collect();
            json!({"summary": payment_plan_summary(&schedule), "first_3_payments": first, "precision": "integer_cents"})
        }
        "finance_revenue_recognition" => {
            let (Some(value), Some(months), Some(elapsed)) = (
                num(params, "contract_value"),
                num(params, "contract_months"),
                num(params, "periods_elapsed"),
            ) else {
                return missing("contract_value/contract_months/periods_elapsed");
            };
            json!({"result": recognize_revenue(value, months as u32, elapsed as u32), "precision": "integer_cents"})
        }
        "finance_depreciation" => {
            let (Some(cost), Some(salvage), Some(life)) = (
                num(params, "cost"),
                num(params, "salvage"),
                num(params, "useful_life_months"),
            ) else {
                return missing("cost/salvage/useful_life_months");
            };
            json!({"monthly_depreciation": straight_line_depreciation(cost, salvage, life as u32), "currency": "USD", "precision": "integer_cents"})
        }
        _ => json!({"error": format!("Unknown finance tool: {}", tool_name)}),
    }
}

// ── PRIME 财务预计算 ────────────────────────────────────────────────────

use std::sync::LazyLock;

static VARIANCE_CTX_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?is)\$\s*([\d,]+(?:\.\d{1,2})?).{0,120}?\$\s*([\d,]+(?:\.\d{1,2})?).{0,120}?(\d+(?:\.\d+)?)\s*%\s*variance",
    )
    .unwrap()
});

/// 从任务文本预计算财务事实（零 API 成本），作为 ground truth 注入 COMPUTE
///
/// 目前覆盖方差场景：任务里同时出现两笔金额与「N% variance」阈值时，
/// 直接给出精确方差与是否超限，COMPUTE 状态无需额外工具调用。
pub fn build_finance_context(task_text: &str) -> String {
    let Some(caps) = VARIANCE_CTX_RE.captures(task_text) else {
        return String::new();
    };
    let parse = |s: &str| s.replace(',', "").parse::<f64>().ok();
    let (Some(invoiced), Some(po), Some(threshold)) =
        (parse(&caps[1]), parse(&caps[2]), caps[3].parse::<f64>().ok())
    else {
        return String::new();
    };
    if po == 0.0 {
        return String::new();
    }
    let check = apply_variance_check(invoiced, po, threshold);
    format!(
        "## PRE-COMPUTED FINANCE FACTS (integer-cent precision)\n\
         Invoiced: ${:.2} | Reference: ${:.2} | Threshold: {}%\n\
         Variance: ${:.2} ({:.4}%) — {} the threshold.",
        invoiced,
        po,
        threshold,
        check.variance,
        check.pct,
        if check.exceeds { "exceeds" } else { "does not exceed" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variance_boundary_precision() {
        // 52340 vs 51200 = 2.2266%，超 2% 阈值
        let r = apply_variance_check(52340.0, 51200.0, 2.0);
        assert!(r.exceeds);
        assert!((r.pct - 2.226562).abs() < 1e-4);
        // 2.04% vs 2.0%：早期取整会把这单错放过去
        let r2 = apply_variance_check(10204.0, 10000.0, 2.0);
        assert!(r2.exceeds);
        let r3 = apply_variance_check(10200.0, 10000.0, 2.0);
        assert!(!r3.exceeds);
    }

    #[test]
    fn test_prorated_amount() {
        // 12 个月 $1200 合同用了 7 个月，剩 5 个月 = $500
        assert_eq!(prorated_amount(1200.0, 7, 12), 500.0);
        assert_eq!(prorated_amount(1200.0, 12, 12), 0.0);
        assert_eq!(prorated_amount(1200.0, 0, 0), 0.0);
    }

    #[test]
    fn test_early_termination_fee() {
        assert_eq!(apply_early_termination_fee(500.0, 10.0), 450.0);
    }

    #[test]
    fn test_sla_credit_with_cap() {
        // 超时 250 分钟，每 100 分钟一档 5%，封顶 10%
        let credit = compute_sla_credit(350.0, 100.0, 10_000.0, 5.0, 10.0);
        assert_eq!(credit, 1000.0); // 3 档 15% 被 10% 封顶
        assert_eq!(compute_sla_credit(50.0, 100.0, 10_000.0, 5.0, 10.0), 0.0);
    }

    #[test]
    fn test_amortization_standard_case() {
        // $200k、5% 年利率、360 期 → 月供约 $1073.64
        let schedule = amortize_loan(200_000.0, 5.0, 360);
        assert_eq!(schedule.len(), 360);
        assert!((schedule[0].payment - 1073.64).abs() < 0.05);
        // 期末余额归零
        assert!(schedule.last().unwrap().balance.abs() < 1.0);
    }

    #[test]
    fn test_zero_rate_amortization() {
        let schedule = amortize_loan(1200.0, 0.0, 12);
        assert_eq!(schedule[0].payment, 100.0);
        assert_eq!(schedule[0].interest, 0.0);
    }

    #[test]
    fn test_revenue_recognition() {
        let r = recognize_revenue(12_000.0, 12, 5);
        assert_eq!(r["recognized_total"], 5000.0);
        assert_eq!(r["deferred"], 7000.0);
    }

    #[test]
    fn test_net_price_delta_refund() {
        let original = vec![("a".to_string(), 30.0), ("b".to_string(), 20.0)];
        let modified = vec![("a".to_string(), 25.0)];
        let cancelled = vec!["b".to_string()];
        let r = net_price_delta(&original, &modified, &cancelled);
        assert_eq!(r["net_delta"], -25.0);
        assert_eq!(r["direction"], "refund");
    }

    #[test]
    fn test_sub_limit_rider_override() {
        assert_eq!(apply_sub_limit(8000.0, 5000.0, None), 5000.0);
        assert_eq!(apply_sub_limit(8000.0, 5000.0, Some(7000.0)), 7000.0);
        assert_eq!(apply_sub_limit(4000.0, 5000.0, Some(7000.0)), 4000.0);
    }

    #[test]
    fn test_finance_tool_dispatch() {
        let result = call_finance_tool(
            "finance_variance_check",
            &json!({"invoiced": 52340.0, "po_amount": 51200.0, "threshold_pct": 2.0}),
        );
        assert_eq!(result["result"]["exceeds"], true);
        let err = call_finance_tool("finance_variance_check", &json!({}));
        assert!(err.get("error").is_some());
    }

    #[test]
    fn test_finance_context_precompute() {
        let ctx = build_finance_context(
            "Acme invoice INV-A for $52340 against PO-A approved at $51200, policy rejects >2% variance",
        );
        assert!(ctx.contains("PRE-COMPUTED FINANCE FACTS"));
        assert!(ctx.contains("exceeds"));
        assert_eq!(build_finance_context("no amounts here"), "");
    }
}
