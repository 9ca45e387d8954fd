
mod session_scenarios;
