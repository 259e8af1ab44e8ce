//! Transition table validation: lint rules and diagnostics.
//!
//! The release graph is fixed at build time, so its structural promises
//! (terminality, a single entry point, exclusive guards) are checked here
//! rather than trusted. Call [`validate`] for advisory diagnostics or
//! [`validate_or_raise`] to fail on the first `Error`-severity issue.

use std::collections::{HashSet, VecDeque};

use shipyard_types::{GateName, PipelineRunContext, PipelineState, SideEffect, Trigger};

use crate::guard::Guard;
use crate::table::{TransitionDef, TransitionTable};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub state: Option<PipelineState>,
    pub trigger: Option<Trigger>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, table: &TransitionTable) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Entries grouped by `(from, trigger)`, groups in first-declared order and
/// entries in declaration order.
fn groups(table: &TransitionTable) -> Vec<Vec<&TransitionDef>> {
    let mut out: Vec<Vec<&TransitionDef>> = Vec::new();
    for def in table.defs() {
        match out
            .iter_mut()
            .find(|g| g[0].from == def.from && g[0].trigger == def.trigger)
        {
            Some(group) => group.push(def),
            None => out.push(vec![def]),
        }
    }
    out
}

/// A grid of contexts covering every guard input: counters on both sides of
/// the budget (including a zero budget) and every gate identity.
fn sample_contexts() -> Vec<PipelineRunContext> {
    let mut samples = Vec::new();
    for max in 0..=4u32 {
        for count in 0..=5u32 {
            for gate in GateName::ALL {
                let mut ctx = PipelineRunContext::new(0, "lint", "lint", "lint", max);
                ctx.fix_cycle_count = count;
                ctx.gate_name = Some(gate);
                samples.push(ctx);
            }
        }
    }
    samples
}

fn diag(
    rule: &str,
    severity: Severity,
    message: String,
    state: Option<PipelineState>,
    trigger: Option<Trigger>,
) -> Diagnostic {
    Diagnostic {
        rule: rule.into(),
        severity,
        message,
        state,
        trigger,
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct TerminalNoOutgoingRule;
impl LintRule for TerminalNoOutgoingRule {
    fn name(&self) -> &str { "terminal_no_outgoing" }
    fn apply(&self, table: &TransitionTable) -> Vec<Diagnostic> {
        table
            .defs()
            .iter()
            .filter(|d| d.from.is_terminal())
            .map(|d| {
                diag(
                    self.name(),
                    Severity::Error,
                    format!("Terminal state {} has an outgoing transition on {}", d.from, d.trigger),
                    Some(d.from),
                    Some(d.trigger),
                )
            })
            .collect()
    }
}

struct InitialStateRule;
impl LintRule for InitialStateRule {
    fn name(&self) -> &str { "initial_state" }
    fn apply(&self, table: &TransitionTable) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        let triggers = table.triggers_from(PipelineState::Created);
        if !triggers.contains(&Trigger::PrOpened) {
            out.push(diag(
                self.name(),
                Severity::Error,
                "Created does not accept PrOpened".into(),
                Some(PipelineState::Created),
                Some(Trigger::PrOpened),
            ));
        }
        for trigger in triggers.into_iter().filter(|t| *t != Trigger::PrOpened) {
            out.push(diag(
                self.name(),
                Severity::Error,
                format!("Created accepts {trigger}; only PrOpened may start a run"),
                Some(PipelineState::Created),
                Some(trigger),
            ));
        }
        for def in table.defs().iter().filter(|d| d.to == PipelineState::Created) {
            out.push(diag(
                self.name(),
                Severity::Error,
                format!("{} -> Created on {}: Created is entered once per run", def.from, def.trigger),
                Some(def.from),
                Some(def.trigger),
            ));
        }
        out
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, table: &TransitionTable) -> Vec<Diagnostic> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(PipelineState::Created);
        queue.push_back(PipelineState::Created);

        while let Some(current) = queue.pop_front() {
            for def in table.outgoing(current) {
                if visited.insert(def.to) {
                    queue.push_back(def.to);
                }
            }
        }

        PipelineState::ALL
            .into_iter()
            .filter(|s| !visited.contains(s))
            .map(|s| {
                diag(
                    self.name(),
                    Severity::Error,
                    format!("State {s} is not reachable from Created"),
                    Some(s),
                    None,
                )
            })
            .collect()
    }
}

struct NoDeadEndRule;
impl LintRule for NoDeadEndRule {
    fn name(&self) -> &str { "no_dead_end" }
    fn apply(&self, table: &TransitionTable) -> Vec<Diagnostic> {
        PipelineState::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .filter(|s| table.outgoing(*s).next().is_none())
            .map(|s| {
                diag(
                    self.name(),
                    Severity::Error,
                    format!("Non-terminal state {s} has no outgoing transitions"),
                    Some(s),
                    None,
                )
            })
            .collect()
    }
}

struct ShadowedTransitionRule;
impl LintRule for ShadowedTransitionRule {
    fn name(&self) -> &str { "shadowed_transition" }
    fn apply(&self, table: &TransitionTable) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for group in groups(table) {
            let mut seen_guards: Vec<Option<Guard>> = Vec::new();
            for (i, def) in group.iter().enumerate() {
                if seen_guards.contains(&None) || seen_guards.contains(&def.guard) {
                    out.push(diag(
                        self.name(),
                        Severity::Error,
                        format!(
                            "{} --{}--> {} (entry {} of its group) can never be selected",
                            def.from,
                            def.trigger,
                            def.to,
                            i + 1
                        ),
                        Some(def.from),
                        Some(def.trigger),
                    ));
                }
                seen_guards.push(def.guard);
            }
        }
        out
    }
}

struct GuardExclusivityRule;
impl LintRule for GuardExclusivityRule {
    fn name(&self) -> &str { "guard_exclusivity" }
    fn apply(&self, table: &TransitionTable) -> Vec<Diagnostic> {
        let samples = sample_contexts();
        let mut out = Vec::new();
        for group in groups(table) {
            if group.len() < 2 || group.iter().any(|d| d.guard.is_none()) {
                continue;
            }
            let (from, trigger) = (group[0].from, group[0].trigger);
            let mut overlapping = false;
            let mut uncovered = false;
            for ctx in &samples {
                let hits = group
                    .iter()
                    .filter(|d| d.guard.is_some_and(|g| g.evaluate(ctx)))
                    .count();
                overlapping |= hits > 1;
                uncovered |= hits == 0;
            }
            if overlapping {
                out.push(diag(
                    self.name(),
                    Severity::Error,
                    format!("Guards on {from} --{trigger}--> overlap; more than one can hold"),
                    Some(from),
                    Some(trigger),
                ));
            }
            if uncovered {
                out.push(diag(
                    self.name(),
                    Severity::Error,
                    format!("Guards on {from} --{trigger}--> leave some contexts unmatched"),
                    Some(from),
                    Some(trigger),
                ));
            }
        }
        out
    }
}

struct FixingEntryRule;
impl LintRule for FixingEntryRule {
    fn name(&self) -> &str { "fixing_entry" }
    fn apply(&self, table: &TransitionTable) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for def in table.defs().iter().filter(|d| d.to == PipelineState::Fixing) {
            if def.from.gate().is_none() {
                out.push(diag(
                    self.name(),
                    Severity::Error,
                    format!(
                        "{} enters Fixing but is not a gate; a pushed fix could not be routed back",
                        def.from
                    ),
                    Some(def.from),
                    Some(def.trigger),
                ));
            }
            if def.guard != Some(Guard::FixCycleUnderBudget) {
                out.push(diag(
                    self.name(),
                    Severity::Error,
                    format!(
                        "{} --{}--> Fixing is not bounded by the fix-cycle budget",
                        def.from, def.trigger
                    ),
                    Some(def.from),
                    Some(def.trigger),
                ));
            }
        }
        out
    }
}

struct SideEffectCoverageRule;
impl LintRule for SideEffectCoverageRule {
    fn name(&self) -> &str { "side_effect_coverage" }
    fn apply(&self, table: &TransitionTable) -> Vec<Diagnostic> {
        let used: HashSet<SideEffect> = table.defs().iter().filter_map(|d| d.side_effect).collect();
        SideEffect::ALL
            .into_iter()
            .filter(|e| !used.contains(e))
            .map(|e| {
                diag(
                    self.name(),
                    Severity::Warning,
                    format!("Side effect '{e}' is never dispatched by any transition"),
                    None,
                    None,
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(table: &TransitionTable) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(TerminalNoOutgoingRule),
        Box::new(InitialStateRule),
        Box::new(ReachabilityRule),
        Box::new(NoDeadEndRule),
        Box::new(ShadowedTransitionRule),
        Box::new(GuardExclusivityRule),
        Box::new(FixingEntryRule),
        Box::new(SideEffectCoverageRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(table));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(table: &TransitionTable) -> shipyard_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(table);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(shipyard_types::ShipyardError::ValidationError(
            messages.join("; "),
        ));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
