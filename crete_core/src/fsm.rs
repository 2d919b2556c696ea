use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Start,
    VerifyEnvironment,
    CleanWorkspace,
    ConnectHost,
    LoadHostHandshake,
    LoadDefaultConfig,
    LoadEmbeddedFileData,
    TransmitConfig,
    PrimeTarget,
    ResolveInstrumentation,
    ValidateSetup,
    Execute,
    AwaitCompletion,
    VerifyInvariants,
    UpdateConfig,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Poll,
    /// The host may hand over the next test case.
    NextTest,
}

/// Inputs of the two guarded transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guards {
    pub process_finished: bool,
    pub first_exec: bool,
}

/// The transition table. `None` means the event is not accepted in `state`
/// and the machine stays where it is.
pub fn transition(state: State, event: Event, guards: &Guards) -> Option<State> {
    use Event as E;
    use State as S;

    let next = match (state, event) {
        (S::Start, E::Start) => S::VerifyEnvironment,
        (S::VerifyEnvironment, E::Poll) => S::CleanWorkspace,
        (S::CleanWorkspace, E::Poll) => S::ConnectHost,
        (S::ConnectHost, E::Poll) => S::LoadHostHandshake,
        (S::LoadHostHandshake, E::Poll) => S::LoadDefaultConfig,
        (S::LoadDefaultConfig, E::Poll) => S::LoadEmbeddedFileData,
        (S::LoadEmbeddedFileData, E::Poll) => S::TransmitConfig,
        (S::TransmitConfig, E::Poll) => S::PrimeTarget,
        (S::PrimeTarget, E::Poll) => S::ResolveInstrumentation,
        (S::ResolveInstrumentation, E::Poll) => S::ValidateSetup,
        (S::ValidateSetup, E::NextTest) => S::Execute,
        (S::Execute, E::Poll) => S::AwaitCompletion,
        (S::AwaitCompletion, E::Poll) if guards.process_finished => S::VerifyInvariants,
        (S::VerifyInvariants, E::Poll) if guards.first_exec => S::UpdateConfig,
        (S::VerifyInvariants, E::NextTest) if !guards.first_exec => S::Execute,
        (S::UpdateConfig, E::NextTest) => S::Execute,
        _ => return None,
    };
    Some(next)
}

/// States that wait for the host to release the next test case.
pub fn awaits_next_test(state: State, guards: &Guards) -> bool {
    match state {
        State::ValidateSetup | State::UpdateConfig => true,
        State::VerifyInvariants => !guards.first_exec,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Guards = Guards {
        process_finished: false,
        first_exec: true,
    };

    fn drive(mut state: State, mut guards: Guards, iterations: usize) -> Vec<(State, State)> {
        let mut taken = Vec::new();
        let mut completed = 0;
        while completed < iterations {
            let event = if state == State::Start {
                Event::Start
            } else if awaits_next_test(state, &guards) {
                Event::NextTest
            } else {
                Event::Poll
            };

            if state == State::AwaitCompletion {
                guards.process_finished = true;
            }
            let next = transition(state, event, &guards).expect("every state has a way forward");
            taken.push((state, next));

            match next {
                State::Execute => guards.process_finished = false,
                State::VerifyInvariants => completed += 1,
                _ => {}
            }
            if state == State::UpdateConfig {
                guards.first_exec = false;
            }
            state = next;
        }
        taken
    }

    #[test]
    fn setup_states_run_in_order() {
        let taken = drive(State::Start, IDLE, 1);
        let visited: Vec<State> = taken.iter().map(|(from, _)| *from).collect();
        assert_eq!(
            &visited[..12],
            &[
                State::Start,
                State::VerifyEnvironment,
                State::CleanWorkspace,
                State::ConnectHost,
                State::LoadHostHandshake,
                State::LoadDefaultConfig,
                State::LoadEmbeddedFileData,
                State::TransmitConfig,
                State::PrimeTarget,
                State::ResolveInstrumentation,
                State::ValidateSetup,
                State::Execute,
            ]
        );
    }

    #[test]
    fn update_config_branch_fires_exactly_once() {
        let taken = drive(State::Start, IDLE, 5);
        let updates = taken
            .iter()
            .filter(|t| **t == (State::VerifyInvariants, State::UpdateConfig))
            .count();
        let loops = taken
            .iter()
            .filter(|t| **t == (State::VerifyInvariants, State::Execute))
            .count();
        assert_eq!(updates, 1);
        // The fifth completion is the last step taken, so it has no successor yet.
        assert_eq!(loops, 3);
    }

    #[test]
    fn await_completion_holds_until_the_process_exits() {
        assert_eq!(transition(State::AwaitCompletion, Event::Poll, &IDLE), None);
        let finished = Guards {
            process_finished: true,
            ..IDLE
        };
        assert_eq!(
            transition(State::AwaitCompletion, Event::Poll, &finished),
            Some(State::VerifyInvariants)
        );
    }

    #[test]
    fn execute_is_only_entered_on_next_test() {
        assert_eq!(transition(State::ValidateSetup, Event::Poll, &IDLE), None);
        assert_eq!(
            transition(State::ValidateSetup, Event::NextTest, &IDLE),
            Some(State::Execute)
        );
        assert_eq!(transition(State::Start, Event::Poll, &IDLE), None);
    }
}
