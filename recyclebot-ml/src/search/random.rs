//! Uniform random search.

use crate::error::Result;
use crate::search::hyperparameters::{HyperParameters, HyperValues};
use crate::search::oracle::{Oracle, OracleState};

pub struct RandomSearchOracle {
    space: HyperParameters,
    state: OracleState,
}

impl RandomSearchOracle {
    pub fn new(space: HyperParameters, state: OracleState) -> Self {
        Self { space, state }
    }
}

impl Oracle for RandomSearchOracle {
    fn name(&self) -> &'static str {
        "random"
    }

    fn space(&self) -> &HyperParameters {
        &self.space
    }

    fn state(&self) -> &OracleState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OracleState {
        &mut self.state
    }

    fn populate_space(&mut self) -> Result<Option<HyperValues>> {
        let mut rng = self.state.next_rng();
        Ok(Some(self.space.sample(&mut rng)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::oracle::Objective;
    use crate::search::trial::TrialStatus;
    use pretty_assertions::assert_eq;
    use recyclebot_core::ParamSpec;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn oracle(dir: &std::path::Path, space: Vec<ParamSpec>, max_trials: usize) -> RandomSearchOracle {
        RandomSearchOracle::new(
            HyperParameters::from_specs(space).unwrap(),
            OracleState::new(dir, max_trials, Objective::from_name("val_accuracy"), 1),
        )
    }

    fn score(value: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("val_accuracy".to_string(), value)])
    }

    #[test]
    fn test_budget_counts_every_outcome() {
        let dir = TempDir::new().unwrap();
        let mut o = oracle(dir.path(), vec![ParamSpec::int("n", 0, 1000)], 3);

        let t0 = o.create_trial().unwrap();
        o.end_trial(&t0.trial_id, TrialStatus::Failed, Some("boom".into())).unwrap();
        let t1 = o.create_trial().unwrap();
        o.end_trial(&t1.trial_id, TrialStatus::Invalid, None).unwrap();
        let t2 = o.create_trial().unwrap();
        o.update_trial(&t2.trial_id, &score(0.5)).unwrap();
        o.end_trial(&t2.trial_id, TrialStatus::Completed, None).unwrap();

        assert_eq!(
            vec![t0.trial_id.as_str(), t1.trial_id.as_str(), t2.trial_id.as_str()],
            vec!["00", "01", "02"]
        );
        assert_eq!(o.create_trial().unwrap().status, TrialStatus::Stopped);
        assert_eq!(o.best_trials(5).len(), 1);
    }

    #[test]
    fn test_small_space_stops_on_collisions() {
        let dir = TempDir::new().unwrap();
        let mut o = oracle(dir.path(), vec![ParamSpec::int("n", 0, 1)], 10);
        let mut created = 0;
        loop {
            let t = o.create_trial().unwrap();
            if t.status == TrialStatus::Stopped {
                break;
            }
            o.end_trial(&t.trial_id, TrialStatus::Completed, None).unwrap();
            created += 1;
        }
        assert_eq!(created, 2);
    }

    #[test]
    fn test_best_trials_ordering() {
        let dir = TempDir::new().unwrap();
        let mut o = oracle(dir.path(), vec![ParamSpec::int("n", 0, 1000)], 5);
        for s in [0.3, 0.9, 0.6] {
            let t = o.create_trial().unwrap();
            o.update_trial(&t.trial_id, &score(s)).unwrap();
            o.end_trial(&t.trial_id, TrialStatus::Completed, None).unwrap();
        }
        let best: Vec<f64> = o.best_trials(2).iter().filter_map(|t| t.score).collect();
        assert_eq!(best, vec![0.9, 0.6]);
    }

    #[test]
    fn test_reload_requeues_running_trials() {
        let dir = TempDir::new().unwrap();
        let (done_id, running_id, running_values) = {
            let mut o = oracle(dir.path(), vec![ParamSpec::int("n", 0, 1000)], 4);
            let done = o.create_trial().unwrap();
            o.update_trial(&done.trial_id, &score(0.7)).unwrap();
            o.end_trial(&done.trial_id, TrialStatus::Completed, None).unwrap();
            let running = o.create_trial().unwrap();
            (done.trial_id, running.trial_id, running.hyperparameters)
        };

        let mut o = oracle(dir.path(), vec![ParamSpec::int("n", 0, 1000)], 4);
        o.reload().unwrap();
        assert_eq!(o.trials().len(), 2);
        assert_eq!(o.state().requeued(), 1);
        assert_eq!(o.best_trials(1)[0].trial_id, done_id);

        let rerun = o.create_trial().unwrap();
        assert_eq!(rerun.trial_id, running_id);
        assert_eq!(rerun.hyperparameters, running_values);
        assert_eq!(rerun.status, TrialStatus::Running);

        let fresh = o.create_trial().unwrap();
        assert_eq!(fresh.trial_id, "02");
        assert!(dir.path().join("trial_02").join("trial.json").exists());
    }

    #[test]
    fn test_reload_without_project_fails() {
        let dir = TempDir::new().unwrap();
        let mut o = oracle(dir.path(), vec![ParamSpec::int("n", 0, 10)], 4);
        assert!(o.reload().is_err());
    }
}
