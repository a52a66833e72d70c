//! 依赖谓词：DependOn / DependAll / DependAny
//!
//! 谓词在规划时与运行前都会重新求值，因为实体状态可能在两者之间改变。

use serde::Serialize;

use crate::state::catalog;
use crate::state::entity::EntityId;

/// 依赖被打破时，依赖方应迁移到的状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixState {
    To(String),
    /// 跟随被依赖实体的新状态（如文件系统 removed 则成员 target 也 removed）
    Follow,
}

/// 单个实体的状态约束
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependOn {
    pub entity: EntityId,
    pub preferred_state: String,
    pub acceptable_states: Vec<String>,
    pub fix_state: Option<FixState>,
}

impl DependOn {
    pub fn new(entity: EntityId, preferred_state: &str) -> Self {
        Self {
            entity,
            preferred_state: preferred_state.to_string(),
            acceptable_states: vec![preferred_state.to_string()],
            fix_state: None,
        }
    }

    /// 显式可接受状态；首选状态总是可接受
    pub fn acceptable(mut self, states: &[&str]) -> Self {
        let mut acceptable: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        if !acceptable.contains(&self.preferred_state) {
            acceptable.push(self.preferred_state.clone());
        }
        self.acceptable_states = acceptable;
        self
    }

    /// 除给定状态外都可接受
    pub fn unacceptable(self, states: &[&str]) -> Self {
        let acceptable: Vec<&str> = catalog::states(self.entity.kind)
            .iter()
            .copied()
            .filter(|s| !states.contains(s))
            .collect();
        self.acceptable(&acceptable)
    }

    pub fn fix(mut self, fix_state: FixState) -> Self {
        self.fix_state = Some(fix_state);
        self
    }

    pub fn accepts(&self, state: &str) -> bool {
        self.acceptable_states.iter().any(|s| s == state)
    }

    /// 被依赖实体进入 `new_state` 后依赖方应迁移到的状态
    pub fn fix_state_for(&self, new_state: &str) -> Option<String> {
        match &self.fix_state {
            Some(FixState::To(s)) => Some(s.clone()),
            Some(FixState::Follow) => Some(new_state.to_string()),
            None => None,
        }
    }

    pub fn satisfied(&self, state_of: &dyn Fn(EntityId) -> Option<String>) -> bool {
        state_of(self.entity)
            .map(|s| self.accepts(&s))
            .unwrap_or(false)
    }
}

/// 可组合的依赖表达式
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    On(DependOn),
    All(Vec<Dependency>),
    Any(Vec<Dependency>),
}

impl Dependency {
    /// 无依赖（恒真）
    pub fn none() -> Self {
        Self::All(Vec::new())
    }

    pub fn all(deps: impl IntoIterator<Item = Dependency>) -> Self {
        Self::All(deps.into_iter().collect())
    }

    pub fn any(deps: impl IntoIterator<Item = Dependency>) -> Self {
        Self::Any(deps.into_iter().collect())
    }

    /// 空的 All / Any 都视为满足
    pub fn satisfied(&self, state_of: &dyn Fn(EntityId) -> Option<String>) -> bool {
        match self {
            Self::On(d) => d.satisfied(state_of),
            Self::All(deps) => deps.iter().all(|d| d.satisfied(state_of)),
            Self::Any(deps) => deps.is_empty() || deps.iter().any(|d| d.satisfied(state_of)),
        }
    }

    /// 展开为叶子谓词列表
    pub fn leaves(&self) -> Vec<&DependOn> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a DependOn>) {
        match self {
            Self::On(d) => out.push(d),
            Self::All(deps) | Self::Any(deps) => {
                for dep in deps {
                    dep.collect_leaves(out);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.leaves().is_empty()
    }
}

impl From<DependOn> for Dependency {
    fn from(dep: DependOn) -> Self {
        Self::On(dep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::entity::EntityKind;
    use std::collections::HashMap;

    fn lookup(states: HashMap<EntityId, &'static str>) -> impl Fn(EntityId) -> Option<String> {
        move |id| states.get(&id).map(|s| s.to_string())
    }

    #[test]
    fn test_unacceptable_keeps_preferred() {
        let lnet = EntityId::new(EntityKind::Lnet, 1);
        let dep = DependOn::new(lnet, "lnet_unloaded").unacceptable(&["unconfigured"]);
        assert!(dep.accepts("lnet_up"));
        assert!(dep.accepts("lnet_unloaded"));
        assert!(!dep.accepts("unconfigured"));
    }

    #[test]
    fn test_all_and_any() {
        let a = EntityId::host(1);
        let b = EntityId::host(2);
        let state_of = lookup(HashMap::from([(a, "managed"), (b, "unconfigured")]));

        let all = Dependency::all([
            DependOn::new(a, "managed").into(),
            DependOn::new(b, "managed").into(),
        ]);
        let any = Dependency::any([
            DependOn::new(a, "managed").into(),
            DependOn::new(b, "managed").into(),
        ]);
        assert!(!all.satisfied(&state_of));
        assert!(any.satisfied(&state_of));
        assert!(Dependency::none().satisfied(&state_of));
        assert!(Dependency::any([]).satisfied(&state_of));
        assert_eq!(all.leaves().len(), 2);
    }

    #[test]
    fn test_missing_entity_is_unsatisfied() {
        let state_of = lookup(HashMap::new());
        assert!(!DependOn::new(EntityId::host(7), "managed").satisfied(&state_of));
    }

    #[test]
    fn test_fix_state_follow() {
        let fs = EntityId::new(EntityKind::Filesystem, 1);
        let dep = DependOn::new(fs, "available").fix(FixState::Follow);
        assert_eq!(dep.fix_state_for("removed").as_deref(), Some("removed"));
        let fixed = DependOn::new(fs, "available").fix(FixState::To("unmounted".into()));
        assert_eq!(fixed.fix_state_for("stopped").as_deref(), Some("unmounted"));
    }
}
