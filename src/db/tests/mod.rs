mod history;
mod migrations;
