pub mod economy;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::GamificationConfig;

/// Membership tier. The ladder runs お試し < 初伝 < 中伝 < 奥伝 < 皆伝 < 管理者;
/// 退会者 sits outside it and blocks everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[repr(i64)]
pub enum Rank {
    #[serde(rename = "お試し")]
    Trial = 0,
    #[serde(rename = "初伝")]
    Shoden = 1,
    #[serde(rename = "中伝")]
    Chuden = 2,
    #[serde(rename = "奥伝")]
    Okuden = 3,
    #[serde(rename = "皆伝")]
    Kaiden = 4,
    #[serde(rename = "管理者")]
    Admin = 5,
    #[serde(rename = "退会者")]
    Withdrawn = -1,
}

impl TryFrom<i64> for Rank {
    type Error = crate::Error;
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Rank::Trial),
            1 => Ok(Rank::Shoden),
            2 => Ok(Rank::Chuden),
            3 => Ok(Rank::Okuden),
            4 => Ok(Rank::Kaiden),
            5 => Ok(Rank::Admin),
            -1 => Ok(Rank::Withdrawn),
            other => Err(crate::Error::Fatal(anyhow::anyhow!(
                "unknown rank value {other}"
            ))),
        }
    }
}

impl std::str::FromStr for Rank {
    type Err = crate::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "お試し" | "trial" => Ok(Rank::Trial),
            "初伝" | "shoden" => Ok(Rank::Shoden),
            "中伝" | "chuden" => Ok(Rank::Chuden),
            "奥伝" | "okuden" => Ok(Rank::Okuden),
            "皆伝" | "kaiden" => Ok(Rank::Kaiden),
            "管理者" | "admin" => Ok(Rank::Admin),
            "退会者" | "withdrawn" => Ok(Rank::Withdrawn),
            other => Err(crate::Error::validation(format!("unknown rank: {other}"))),
        }
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Rank::Trial => "お試し",
            Rank::Shoden => "初伝",
            Rank::Chuden => "中伝",
            Rank::Okuden => "奥伝",
            Rank::Kaiden => "皆伝",
            Rank::Admin => "管理者",
            Rank::Withdrawn => "退会者",
        };
        f.write_str(label)
    }
}

impl Rank {
    /// Position on the ladder, `None` for the suspended state.
    pub fn ladder_position(self) -> Option<i64> {
        match self {
            Rank::Withdrawn => None,
            other => Some(other as i64),
        }
    }

    pub fn is_suspended(self) -> bool {
        self == Rank::Withdrawn
    }

    pub fn is_admin(self) -> bool {
        self == Rank::Admin
    }

    /// Whether this rank may access content gated at `required`.
    pub fn satisfies(self, required: Rank) -> bool {
        match (self.ladder_position(), required.ladder_position()) {
            (None, _) => false,
            (Some(_), None) => false,
            (Some(own), Some(req)) => own >= req,
        }
    }

    /// Course-completion promotion: only learners on the ladder below
    /// `target` move, and never into 管理者.
    pub fn promoted_to(self, target: Rank) -> Option<Rank> {
        if target.is_admin() || target.is_suspended() || self.is_admin() {
            return None;
        }
        match (self.ladder_position(), target.ladder_position()) {
            (Some(own), Some(to)) if to > own => Some(target),
            _ => None,
        }
    }
}

pub fn level_for(config: &GamificationConfig, experience: i64) -> i64 {
    experience.max(0) / config.xp_per_level.max(1) + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LevelUp {
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EconomyState {
    pub experience: i64,
    pub gems: i64,
}

/// What an evaluation is worth before it touches any balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reward {
    pub experience: i64,
    pub gems: i64,
}

/// Experience scales with the score; gems only for a passing score.
/// Late work earns `late_reward_ratio` of the experience and no gems.
pub fn reward_for(
    config: &GamificationConfig,
    score: i64,
    reward_exp: i64,
    reward_gems: i64,
    late: bool,
) -> Reward {
    let score = score.clamp(0, 100);
    let mut experience = (reward_exp.max(0) as f64 * score as f64 / 100.0).round();
    if late {
        experience = (experience * config.late_reward_ratio.clamp(0.0, 1.0)).round();
    }
    let gems = if score >= config.pass_score && !late {
        reward_gems.max(0)
    } else {
        0
    };
    Reward {
        experience: experience as i64,
        gems,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EvaluationOutcome {
    pub experience: i64,
    pub level: i64,
    pub gems: i64,
    pub experience_gained: i64,
    pub gems_gained: i64,
    /// Set once when the batch crosses one or more level thresholds.
    pub level_up: Option<LevelUp>,
}

/// Pure fold of a batch of experience deltas. The level-up signal is computed
/// from the batch's endpoints so crossing a threshold yields one event.
pub fn apply_experience(
    config: &GamificationConfig,
    state: EconomyState,
    deltas: &[i64],
) -> (EconomyState, Option<LevelUp>) {
    let before = level_for(config, state.experience);
    let experience = deltas
        .iter()
        .fold(state.experience.max(0), |xp, delta| xp + (*delta).max(0));
    let after = level_for(config, experience);
    let level_up = (after > before).then_some(LevelUp {
        from: before,
        to: after,
    });
    (
        EconomyState {
            experience,
            gems: state.gems,
        },
        level_up,
    )
}

/// Outcome of adding `reward` to `state`.
pub fn apply_reward(
    config: &GamificationConfig,
    state: EconomyState,
    reward: Reward,
) -> EvaluationOutcome {
    let (next, level_up) = apply_experience(config, state, &[reward.experience]);
    EvaluationOutcome {
        experience: next.experience,
        level: level_for(config, next.experience),
        gems: state.gems + reward.gems,
        experience_gained: reward.experience,
        gems_gained: reward.gems,
        level_up,
    }
}

/// New balances after a scored evaluation, from the balances before it.
pub fn apply_evaluation(
    config: &GamificationConfig,
    state: EconomyState,
    score: i64,
    reward_exp: i64,
    reward_gems: i64,
    late: bool,
) -> EvaluationOutcome {
    apply_reward(
        config,
        state,
        reward_for(config, score, reward_exp, reward_gems, late),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GamificationConfig {
        GamificationConfig::default()
    }

    #[test]
    fn level_ladder() {
        let config = config();
        assert_eq!(level_for(&config, 0), 1);
        assert_eq!(level_for(&config, 999), 1);
        assert_eq!(level_for(&config, 1000), 2);
        assert_eq!(level_for(&config, 2500), 3);
    }

    #[test]
    fn crossing_a_threshold_levels_up_once() {
        let config = config();
        let state = EconomyState {
            experience: 950,
            gems: 3,
        };
        let outcome = apply_evaluation(&config, state, 100, 100, 0, false);
        assert_eq!(outcome.experience, 1050);
        assert_eq!(outcome.level, 2);
        assert_eq!(outcome.level_up, Some(LevelUp { from: 1, to: 2 }));

        let (next, level_up) = apply_experience(&config, state, &[50, 50]);
        assert_eq!(next.experience, 1050);
        assert_eq!(level_up, Some(LevelUp { from: 1, to: 2 }));

        let (_, none) = apply_experience(&config, next, &[10]);
        assert_eq!(none, None);
    }

    #[test]
    fn rewards_follow_score_and_lateness() {
        let config = config();
        assert_eq!(
            reward_for(&config, 80, 200, 5, false),
            Reward {
                experience: 160,
                gems: 5
            }
        );
        assert_eq!(
            reward_for(&config, 40, 200, 5, false),
            Reward {
                experience: 80,
                gems: 0
            }
        );
        assert_eq!(
            reward_for(&config, 80, 200, 5, true),
            Reward {
                experience: 80,
                gems: 0
            }
        );
    }

    #[test]
    fn negative_deltas_never_reduce_experience() {
        let (next, _) = apply_experience(&config(), EconomyState::default(), &[-500, 20]);
        assert_eq!(next.experience, 20);
    }

    #[test]
    fn rank_gating() {
        assert!(Rank::Chuden.satisfies(Rank::Shoden));
        assert!(!Rank::Trial.satisfies(Rank::Shoden));
        assert!(Rank::Admin.satisfies(Rank::Kaiden));
        assert!(!Rank::Withdrawn.satisfies(Rank::Trial));
        assert_eq!(Rank::Shoden.promoted_to(Rank::Chuden), Some(Rank::Chuden));
        assert_eq!(Rank::Okuden.promoted_to(Rank::Chuden), None);
        assert_eq!(Rank::Admin.promoted_to(Rank::Kaiden), None);
        assert_eq!(Rank::Withdrawn.promoted_to(Rank::Kaiden), None);
        assert_eq!("中伝".parse::<Rank>().unwrap(), Rank::Chuden);
        assert_eq!(Rank::Kaiden.to_string(), "皆伝");
    }
}
