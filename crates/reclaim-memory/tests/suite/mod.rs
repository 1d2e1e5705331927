mod events;
mod logging;
mod orchestrator;
mod support;
mod system;
