//! Chat message formatting for executed signals

use crate::types::{Direction, ExecutionPlan, OrderIds, PrePumpEvent};

const RULE: &str = "================================";

fn check(flag: bool) -> &'static str {
    if flag {
        "✅"
    } else {
        "❌"
    }
}

/// Signed percentage with two decimals, e.g. `-0.44%`
fn pct(fraction: f64) -> String {
    format!("{:+.2}%", fraction * 100.0)
}

/// Fixed decimals with comma thousands separators, e.g. `62,959.00`
pub fn with_thousands(value: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (formatted.as_str(), None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (idx, ch) in int_part.chars().enumerate() {
        if idx > 0 && (int_part.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value < 0.0 { "-" } else { "" };
    match frac_part {
        Some(frac) => format!("{}{}.{}", sign, grouped, frac),
        None => format!("{}{}", sign, grouped),
    }
}

/// Render an executed signal for the chat channel
pub fn format_signal(event: &PrePumpEvent, plan: &ExecutionPlan, order_ids: Option<&OrderIds>) -> String {
    let trap = event.raw.source_trap_raw();
    let absorption = &event.raw.source_absorption_components;

    let liq_swept = if trap.short_cluster_p90_notional > 0.0 {
        trap.short_cluster_p90_notional
    } else {
        trap.long_cluster_p90_notional
    };
    let funding_rate = trap.funding.avg_funding;
    let oi_spread = trap.oi_spread_pct;

    let cvd_confirmed = match event.direction {
        Direction::Long => absorption.cvd_long >= 0.5 || absorption.hidden_divergence_long,
        Direction::Short => absorption.cvd_short >= 0.5 || absorption.hidden_divergence_short,
    };
    let direction_title = match event.direction {
        Direction::Long => "REVERSAL IMMINENT",
        Direction::Short => "REVERSAL DOWN IMMINENT",
    };
    let funding_state = if funding_rate < 0.0 {
        "neg"
    } else if funding_rate > 0.0 {
        "pos"
    } else {
        "reset"
    };

    let ids_line = order_ids
        .map(|ids| {
            format!(
                "\nORDERS: E#{} SL#{} TP1#{} TP2#{}\n",
                ids.entry, ids.sl, ids.tp1, ids.tp2
            )
        })
        .unwrap_or_default();

    let mut out = String::from("<pre>");
    out.push_str(&format!("🎯 PHANTOM SIGNAL - {}\n", event.symbol));
    out.push_str(RULE);
    out.push('\n');
    out.push_str(&format!("TRAP DETECTED -> {}\n\n", direction_title));
    out.push_str(&format!(
        "Liquidation Swept : ${} {}\n",
        with_thousands(liq_swept, 0),
        check(liq_swept > 0.0)
    ));
    out.push_str(&format!(
        "Funding Rate      : {:+.4}% -> {} {}\n",
        funding_rate * 100.0,
        funding_state,
        check(funding_rate.abs() > 0.0)
    ));
    out.push_str(&format!(
        "Cross-Exchange OI : {:.2}% {}\n",
        oi_spread,
        check(oi_spread > 0.4)
    ));
    out.push_str(&format!("CHoCH 5m          : {}\n", check(event.components.choch)));
    out.push_str(&format!("CVD Divergence    : {}\n\n", check(cvd_confirmed)));
    out.push_str(&format!("SCORE: {}/100\n\n", (event.score * 100.0).round() as i64));
    out.push_str(&format!("Entry : ${}\n", with_thousands(plan.entry, 2)));
    out.push_str(&format!("SL    : ${} ({})\n", with_thousands(plan.sl, 2), pct(plan.sl_pct)));
    out.push_str(&format!("TP1   : ${} ({})\n", with_thousands(plan.tp1, 2), pct(plan.tp1_pct)));
    out.push_str(&format!("TP2   : ${} ({})\n", with_thousands(plan.tp2, 2), pct(plan.tp2_pct)));
    out.push_str(&format!("R:R   : 1:{:.2}", plan.rr));
    out.push_str(&ids_line);
    out.push_str(RULE);
    out.push_str("</pre>");
    out
}

/// Best-effort alert for a failed planning/placement attempt
pub fn format_execution_error(symbol: &str, direction: Direction, error: &str) -> String {
    format!("<pre>PHANTOM EXECUTION ERROR\n{} {}\n{}</pre>", symbol, direction, error)
}
